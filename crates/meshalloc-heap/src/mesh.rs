//! Meshing and compaction. Everything here runs with the heap lock held.

use meshalloc_sys::span::Orphan;
use rand::seq::SliceRandom;

use crate::{
  HeapResult,
  config::NCLASSES,
  global::{
    HeapState,
    MiniHeapId,
  },
  stats::CompactionReport,
};

#[cfg(unix)]
fn pause() -> HeapResult<impl Sized> {
  Ok(meshalloc_sync::quiesce::stop_the_world()?)
}

#[cfg(not(unix))]
fn pause() -> HeapResult<()> {
  Err(crate::HeapError::System(meshalloc_sys::system::SysError::Unsupported))
}

impl HeapState {
  pub(crate) fn meshable(&self, a: MiniHeapId, b: MiniHeapId) -> bool {
    if a == b {
      return false;
    }
    match (self.table.get(a), self.table.get(b)) {
      (Some(left), Some(right)) => left.meshable_with(right),
      _ => false,
    }
  }

  pub(crate) fn mesh_locked(&mut self, a: MiniHeapId, b: &mut Option<MiniHeapId>) -> bool {
    let Some(consumed) = *b else {
      return false;
    };

    match self.try_mesh(a, consumed) {
      Ok(Some(released)) => {
        *b = None;
        self.stats.meshed(released);
        true
      }
      Ok(None) => {
        self.stats.refused();
        tracing::trace!(survivor = a.index(), consumed = consumed.index(), "mesh refused");
        false
      }
      Err(err) => {
        self.stats.refused();
        tracing::warn!(?err, survivor = a.index(), consumed = consumed.index(), "mesh aborted");
        false
      }
    }
  }

  /// Returns the number of backing bytes released, or `None` if the pair is
  /// not meshable. An `Err` means the world was stopped but nothing was
  /// remapped.
  fn try_mesh(&mut self, a: MiniHeapId, b: MiniHeapId) -> HeapResult<Option<usize>> {
    let system = &*self.system;
    let Some((survivor, consumed)) = self.table.pair_mut(a, b) else {
      return Ok(None);
    };
    if !survivor.meshable_with(consumed) {
      return Ok(None);
    }

    // Nothing between the pause and its end may allocate: a parked thread can
    // be holding the allocator's lock.
    let mut orphans: Vec<Orphan> = Vec::with_capacity(1 + consumed.meshed().len());
    {
      let _world = pause()?;

      unsafe { survivor.copy_live_from(consumed) };

      let primary = unsafe { system.alias(consumed.span_mut(), survivor.span()) }?;
      orphans.extend(primary);

      for span in consumed.meshed_mut() {
        match unsafe { system.alias(span, survivor.span()) } {
          Ok(orphan) => orphans.extend(orphan),
          Err(err) => panic!("mesh: span at {:#x} half remapped: {err:?}", span.base()),
        }
      }

      if let Err(err) = survivor.bitmap().merge(consumed.bitmap()) {
        panic!("mesh: merged bitmaps of different shapes: {err:?}");
      }
    }

    let released = orphans.iter().map(|orphan| orphan.len).sum();
    for orphan in orphans {
      system.discard(orphan);
    }

    self.retire(a, b);
    Ok(Some(released))
  }

  /// Moves the spans of `consumed` under `survivor` once their pages alias
  /// the survivor's backing.
  fn retire(&mut self, survivor: MiniHeapId, consumed: MiniHeapId) {
    let Some(retired) = self.table.remove(consumed) else {
      panic!("mesh: consumed miniheap {consumed:?} vanished");
    };
    if let Some(class) = retired.class() {
      self.detach(class, consumed);
    }

    for span in retired.spans() {
      if let Err(err) = self.pages.reassign(span, survivor.index()) {
        panic!("mesh: page map lost span at {:#x}: {err:?}", span.base());
      }
    }

    let rng = &mut self.rng;
    let Some(heap) = self.table.get_mut(survivor) else {
      panic!("mesh: survivor {survivor:?} vanished");
    };
    heap.adopt(retired.into_spans());
    heap.reattach(rng);

    let in_use = heap.in_use_count();
    self.rebin(survivor);

    tracing::debug!(
      survivor = survivor.index(),
      consumed = consumed.index(),
      in_use,
      "meshed miniheaps"
    );
  }

  pub(crate) fn compact(&mut self) -> CompactionReport {
    let mut report = CompactionReport::default();

    let empty: Vec<MiniHeapId> = self
      .table
      .iter()
      .filter(|(_, heap)| heap.class().is_some() && heap.is_empty())
      .map(|(id, _)| id)
      .collect();
    for id in empty {
      self.release(id);
      report.reclaim();
    }

    if self.config.meshing_enabled() {
      let cutoff = self.config.occupancy_cutoff();
      let mut candidates: Vec<Vec<MiniHeapId>> = (0..NCLASSES).map(|_| Vec::new()).collect();
      for (id, heap) in self.table.iter() {
        if let Some(class) = heap.class() {
          if heap.occupancy() < cutoff {
            candidates[class.index()].push(id);
          }
        }
      }

      for class in candidates {
        self.mesh_class(class, &mut report);
      }
    }

    self.stats.compacted();
    self.last_compaction = Some(std::time::Instant::now());
    tracing::debug!(
      reclaimed = report.reclaimed(),
      meshed = report.meshed(),
      refused = report.refused(),
      released = report.bytes_released(),
      "compaction pass"
    );
    report
  }

  /// Split mesher: shuffle, halve, and probe each left miniheap against a
  /// window of right ones. The fuller miniheap of a pair survives.
  fn mesh_class(&mut self, mut candidates: Vec<MiniHeapId>, report: &mut CompactionReport) {
    if candidates.len() < 2 {
      return;
    }

    candidates.shuffle(&mut self.rng);
    let (left, right) = candidates.split_at(candidates.len() / 2);
    let mut right: Vec<Option<MiniHeapId>> = right.iter().copied().map(Some).collect();
    let probes = self.config.mesh_probes().min(right.len());

    for (i, &l) in left.iter().enumerate() {
      for step in 0..probes {
        let j = (i + step) % right.len();
        let Some(r) = right[j] else {
          continue;
        };
        if !self.meshable(l, r) {
          continue;
        }

        let l_used = self.table.get(l).map_or(0, |heap| heap.in_use_count());
        let r_used = self.table.get(r).map_or(0, |heap| heap.in_use_count());
        let (survivor, consumed) = if l_used >= r_used { (l, r) } else { (r, l) };

        let before = self.stats.bytes_released();
        let mut handle = Some(consumed);
        if self.mesh_locked(survivor, &mut handle) {
          report.mesh(self.stats.bytes_released() - before);
          right[j] = None;
          break;
        }
        report.refuse();
      }
    }
  }
}
