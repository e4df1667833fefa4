use core::ptr::NonNull;
use std::time::Instant;

use meshalloc_sys::system::{
  SysError,
  System,
  default_system,
};
use rand::{
  SeedableRng,
  rngs::SmallRng,
};
use spin::{
  Mutex,
  MutexGuard,
};

use crate::{
  HeapError,
  HeapResult,
  classes::{
    SizeClassIndex,
    max_count,
    span_size,
  },
  config::{
    HeapConfig,
    MAX_SIZE,
    NCLASSES,
  },
  lookup::PageMap,
  miniheap::MiniHeap,
  stats::{
    CompactionReport,
    HeapStats,
  },
};

/// Handle to a miniheap owned by a [`GlobalHeap`]. Handles are checked on
/// every use; one whose miniheap was freed or meshed away resolves to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MiniHeapId {
  index: u32,
  generation: u32,
}

impl MiniHeapId {
  pub const fn index(&self) -> u32 {
    self.index
  }
}

struct Entry {
  generation: u32,
  heap: Option<MiniHeap>,
}

pub(crate) struct Table {
  entries: Vec<Entry>,
  vacant: Vec<u32>,
  live: usize,
}

impl Table {
  const fn new() -> Self {
    Self {
      entries: Vec::new(),
      vacant: Vec::new(),
      live: 0,
    }
  }

  fn insert(&mut self, heap: MiniHeap) -> MiniHeapId {
    self.live += 1;
    if let Some(index) = self.vacant.pop() {
      let entry = &mut self.entries[index as usize];
      entry.heap = Some(heap);
      return MiniHeapId {
        index,
        generation: entry.generation,
      };
    }

    let index = self.entries.len() as u32;
    self.entries.push(Entry {
      generation: 0,
      heap: Some(heap),
    });
    MiniHeapId {
      index,
      generation: 0,
    }
  }

  fn entry(&self, id: MiniHeapId) -> Option<&Entry> {
    self
      .entries
      .get(id.index as usize)
      .filter(|entry| entry.generation == id.generation)
  }

  pub(crate) fn get(&self, id: MiniHeapId) -> Option<&MiniHeap> {
    self.entry(id)?.heap.as_ref()
  }

  pub(crate) fn get_mut(&mut self, id: MiniHeapId) -> Option<&mut MiniHeap> {
    let entry = self.entries.get_mut(id.index as usize)?;
    if entry.generation != id.generation {
      return None;
    }
    entry.heap.as_mut()
  }

  /// Current handle for the miniheap stored at `index`, if any.
  pub(crate) fn id_at(&self, index: u32) -> Option<MiniHeapId> {
    let entry = self.entries.get(index as usize)?;
    entry.heap.as_ref()?;
    Some(MiniHeapId {
      index,
      generation: entry.generation,
    })
  }

  pub(crate) fn remove(&mut self, id: MiniHeapId) -> Option<MiniHeap> {
    let entry = self.entries.get_mut(id.index as usize)?;
    if entry.generation != id.generation {
      return None;
    }
    let heap = entry.heap.take()?;
    entry.generation = entry.generation.wrapping_add(1);
    self.vacant.push(id.index);
    self.live -= 1;
    Some(heap)
  }

  /// Two distinct live miniheaps, mutably.
  pub(crate) fn pair_mut(
    &mut self,
    a: MiniHeapId,
    b: MiniHeapId,
  ) -> Option<(&mut MiniHeap, &mut MiniHeap)> {
    let (ia, ib) = (a.index as usize, b.index as usize);
    if ia == ib || ia.max(ib) >= self.entries.len() {
      return None;
    }

    let (low, high) = self.entries.split_at_mut(ia.max(ib));
    let (first, second) = (&mut low[ia.min(ib)], &mut high[0]);
    let (ea, eb) = if ia < ib {
      (first, second)
    } else {
      (second, first)
    };

    if ea.generation != a.generation || eb.generation != b.generation {
      return None;
    }
    Some((ea.heap.as_mut()?, eb.heap.as_mut()?))
  }

  pub(crate) fn iter(&self) -> impl Iterator<Item = (MiniHeapId, &MiniHeap)> {
    self.entries.iter().enumerate().filter_map(|(index, entry)| {
      let heap = entry.heap.as_ref()?;
      Some((
        MiniHeapId {
          index: index as u32,
          generation: entry.generation,
        },
        heap,
      ))
    })
  }

  pub(crate) fn live(&self) -> usize {
    self.live
  }
}

pub(crate) struct HeapState {
  pub(crate) config: HeapConfig,
  pub(crate) system: Box<dyn System>,
  pub(crate) table: Table,
  pub(crate) pages: PageMap,
  /// Pooled miniheaps with at least one free slot, per size class.
  pub(crate) bins: Vec<Vec<MiniHeapId>>,
  pub(crate) rng: SmallRng,
  pub(crate) stats: HeapStats,
  pub(crate) last_compaction: Option<Instant>,
}

impl HeapState {
  fn new(config: HeapConfig, system: Box<dyn System>) -> Self {
    let rng = match config.seed() {
      Some(seed) => SmallRng::seed_from_u64(seed),
      None => SmallRng::from_os_rng(),
    };

    Self {
      config,
      system,
      table: Table::new(),
      pages: PageMap::new(),
      bins: (0..NCLASSES).map(|_| Vec::new()).collect(),
      rng,
      stats: HeapStats::default(),
      last_compaction: None,
    }
  }

  pub(crate) fn attach(&mut self, class: SizeClassIndex, id: MiniHeapId) {
    let bin = &mut self.bins[class.index()];
    if !bin.contains(&id) {
      bin.push(id);
    }
  }

  pub(crate) fn detach(&mut self, class: SizeClassIndex, id: MiniHeapId) {
    self.bins[class.index()].retain(|other| *other != id);
  }

  /// Puts a pooled miniheap in its bin exactly when it has a free slot.
  pub(crate) fn rebin(&mut self, id: MiniHeapId) {
    let Some(heap) = self.table.get(id) else {
      return;
    };
    let (Some(class), full) = (heap.class(), heap.is_full()) else {
      return;
    };
    if full {
      self.detach(class, id);
    } else {
      self.attach(class, id);
    }
  }

  fn create(&mut self, object_size: usize, class: Option<SizeClassIndex>) -> HeapResult<MiniHeapId> {
    if object_size == 0 {
      return Err(HeapError::ZeroSize);
    }
    if object_size > MAX_SIZE {
      return Err(HeapError::TooLarge {
        size: object_size,
        max: MAX_SIZE,
      });
    }

    let size = span_size(object_size).map_err(|_| HeapError::TooLarge {
      size: object_size,
      max: MAX_SIZE,
    })?;
    let span = self.system.alloc(size)?;
    let heap = MiniHeap::new(span, object_size, max_count(object_size), class, &mut self.rng);
    let id = self.table.insert(heap);

    let registered = match self.table.get(id) {
      Some(heap) => self.pages.register(heap.span(), id.index),
      None => unreachable!("freshly inserted miniheap is missing"),
    };
    if let Err(err) = registered {
      if let Some(heap) = self.table.remove(id) {
        for span in heap.into_spans() {
          if let Err(unmap) = unsafe { self.system.dealloc(span) } {
            tracing::warn!(?unmap, "failed to unmap span of unregistered miniheap");
          }
        }
      }
      return Err(err.into());
    }

    self.stats.created();
    tracing::debug!(
      index = id.index,
      object_size,
      max_count = max_count(object_size),
      span = size,
      pooled = class.is_some(),
      "created miniheap"
    );
    Ok(id)
  }

  pub(crate) fn resolve(&self, addr: usize) -> Option<MiniHeapId> {
    let index = self.pages.lookup(addr)?;
    self.table.id_at(index)
  }

  fn expect_live(&self, id: MiniHeapId, op: &str) -> &MiniHeap {
    match self.table.get(id) {
      Some(heap) => heap,
      None => panic!("{op}: stale miniheap handle {id:?}"),
    }
  }

  fn expect_live_mut(&mut self, id: MiniHeapId, op: &str) -> &mut MiniHeap {
    match self.table.get_mut(id) {
      Some(heap) => heap,
      None => panic!("{op}: stale miniheap handle {id:?}"),
    }
  }

  pub(crate) fn release(&mut self, id: MiniHeapId) {
    let heap = self.expect_live(id, "free_miniheap");
    if !heap.is_empty() {
      panic!(
        "free_miniheap: miniheap at {:#x} still holds {} objects",
        heap.base(),
        heap.in_use_count()
      );
    }

    let Some(heap) = self.table.remove(id) else {
      return;
    };
    if let Some(class) = heap.class() {
      self.detach(class, id);
    }

    for span in heap.spans() {
      if let Err(err) = self.pages.unregister(span) {
        tracing::warn!(?err, base = span.base(), "span missing from page map");
      }
    }

    let base = heap.base();
    for span in heap.into_spans() {
      if let Err(err) = unsafe { self.system.dealloc(span) } {
        tracing::warn!(?err, "failed to unmap miniheap span");
      }
    }

    self.stats.freed();
    tracing::debug!(index = id.index, base, "freed miniheap");
  }

  pub(crate) fn free(&mut self, addr: usize) {
    let Some(id) = self.resolve(addr) else {
      panic!("free: {addr:#x} is not owned by any miniheap");
    };

    let heap = self.expect_live_mut(id, "free");
    let was_full = heap.is_full();
    heap.free(addr);

    if was_full {
      if let Some(class) = heap.class() {
        self.attach(class, id);
      }
    }
  }

  pub(crate) fn allocate(&mut self, size: usize) -> HeapResult<NonNull<u8>> {
    let class = SizeClassIndex::for_size(size).ok_or(HeapError::TooLarge {
      size,
      max: MAX_SIZE,
    })?;
    let bin = class.index();

    while let Some(&id) = self.bins[bin].last() {
      let Some(heap) = self.table.get_mut(id) else {
        self.bins[bin].pop();
        continue;
      };

      let ptr = heap.malloc();
      if heap.is_full() {
        self.bins[bin].pop();
      }
      if let Some(ptr) = ptr {
        return Ok(ptr);
      }
    }

    let id = self.create(class.object_size(), Some(class))?;
    let heap = self.expect_live_mut(id, "allocate");
    let ptr = heap.malloc();
    if !heap.is_full() {
      self.attach(class, id);
    }
    ptr.ok_or(HeapError::System(SysError::OutOfMemory))
  }
}

/// Exclusive access to the heap. Allocation, free and meshing all run under
/// this lock.
pub struct HeapGuard<'a> {
  state: MutexGuard<'a, HeapState>,
}

impl HeapGuard<'_> {
  /// Meshes `b` into `a` with the heap lock already held. On success `b` is
  /// set to `None`; a refused mesh leaves both miniheaps untouched.
  pub fn mesh_locked(&mut self, a: MiniHeapId, b: &mut Option<MiniHeapId>) -> bool {
    self.state.mesh_locked(a, b)
  }

  pub fn meshable(&self, a: MiniHeapId, b: MiniHeapId) -> bool {
    self.state.meshable(a, b)
  }

  pub fn allocated_miniheap_count(&self) -> usize {
    self.state.table.live()
  }

  pub fn with_miniheap<R>(&self, id: MiniHeapId, f: impl FnOnce(&MiniHeap) -> R) -> Option<R> {
    self.state.table.get(id).map(f)
  }
}

/// The process-wide set of miniheaps.
pub struct GlobalHeap {
  state: Mutex<HeapState>,
}

impl GlobalHeap {
  pub fn new(config: HeapConfig) -> HeapResult<Self> {
    Ok(Self::with_system(config, default_system()?))
  }

  pub fn with_system(config: HeapConfig, system: Box<dyn System>) -> Self {
    Self {
      state: Mutex::new(HeapState::new(config, system)),
    }
  }

  pub fn lock(&self) -> HeapGuard<'_> {
    HeapGuard {
      state: self.state.lock(),
    }
  }

  pub fn config(&self) -> HeapConfig {
    self.state.lock().config
  }

  /// Maps a fresh miniheap for `object_size` byte objects. The caller owns
  /// it: `allocate` never hands out its slots and compaction never meshes
  /// or reclaims it.
  pub fn alloc_miniheap(&self, object_size: usize) -> HeapResult<MiniHeapId> {
    self.state.lock().create(object_size, None)
  }

  /// Unmaps an empty miniheap and every span meshed into it.
  ///
  /// # Panics
  ///
  /// Panics if the handle is stale or the miniheap still holds objects.
  pub fn free_miniheap(&self, id: MiniHeapId) {
    self.state.lock().release(id);
  }

  pub fn allocated_miniheap_count(&self) -> usize {
    self.state.lock().table.live()
  }

  /// Frees the object at `ptr`, whichever span of whichever miniheap it
  /// lies in.
  ///
  /// # Panics
  ///
  /// Panics on a double free or an address no miniheap owns.
  pub fn free(&self, ptr: *const u8) {
    self.state.lock().free(ptr as usize);
  }

  pub fn allocate(&self, size: usize) -> HeapResult<NonNull<u8>> {
    self.state.lock().allocate(size)
  }

  pub fn deallocate(&self, ptr: NonNull<u8>) {
    self.free(ptr.as_ptr());
  }

  /// Owner of `ptr`, if any.
  pub fn lookup(&self, ptr: *const u8) -> Option<MiniHeapId> {
    self.state.lock().resolve(ptr as usize)
  }

  pub fn meshable(&self, a: MiniHeapId, b: MiniHeapId) -> bool {
    self.state.lock().meshable(a, b)
  }

  /// Meshes `b` into `a`. See [`HeapGuard::mesh_locked`].
  pub fn mesh(&self, a: MiniHeapId, b: &mut Option<MiniHeapId>) -> bool {
    self.lock().mesh_locked(a, b)
  }

  pub fn with_miniheap<R>(&self, id: MiniHeapId, f: impl FnOnce(&MiniHeap) -> R) -> Option<R> {
    self.state.lock().table.get(id).map(f)
  }

  pub fn in_use_count(&self, id: MiniHeapId) -> Option<usize> {
    self.with_miniheap(id, MiniHeap::in_use_count)
  }

  pub fn base(&self, id: MiniHeapId) -> Option<usize> {
    self.with_miniheap(id, MiniHeap::base)
  }

  /// Raw occupancy bytes, as compared by the meshability test.
  pub fn bitmap_bytes(&self, id: MiniHeapId) -> Option<Vec<u8>> {
    self.with_miniheap(id, |heap| heap.bitmap().to_bytes())
  }

  /// # Panics
  ///
  /// Panics if the handle is stale, `index` is out of range or the slot is
  /// occupied.
  pub fn malloc_at(&self, id: MiniHeapId, index: usize) -> NonNull<u8> {
    let mut state = self.state.lock();
    let heap = state.expect_live_mut(id, "malloc_at");
    let ptr = heap.malloc_at(index);
    if let (true, Some(class)) = (heap.is_full(), heap.class()) {
      state.detach(class, id);
    }
    ptr
  }

  pub fn malloc(&self, id: MiniHeapId) -> Option<NonNull<u8>> {
    let mut state = self.state.lock();
    let heap = state.expect_live_mut(id, "malloc");
    let ptr = heap.malloc()?;
    if let (true, Some(class)) = (heap.is_full(), heap.class()) {
      state.detach(class, id);
    }
    Some(ptr)
  }

  /// Rebuilds the freelist of `id` from its bitmap.
  pub fn reattach(&self, id: MiniHeapId) {
    let mut state = self.state.lock();
    let HeapState { table, rng, .. } = &mut *state;
    match table.get_mut(id) {
      Some(heap) => heap.reattach(rng),
      None => panic!("reattach: stale miniheap handle {id:?}"),
    }
    state.rebin(id);
  }

  /// Makes the object at `ptr` the only live object of `id`.
  pub fn free_entire_except(&self, id: MiniHeapId, ptr: *const u8) -> HeapResult<()> {
    let mut state = self.state.lock();
    let HeapState { table, rng, .. } = &mut *state;
    match table.get_mut(id) {
      Some(heap) => heap.free_entire_except(ptr as usize, rng)?,
      None => panic!("free_entire_except: stale miniheap handle {id:?}"),
    }
    state.rebin(id);
    Ok(())
  }

  /// Reclaims empty pooled miniheaps and meshes sparse ones.
  pub fn compact(&self) -> CompactionReport {
    self.state.lock().compact()
  }

  /// Runs [`compact`](Self::compact) unless the previous pass finished less
  /// than `mesh_period` ago.
  pub fn maybe_compact(&self) -> Option<CompactionReport> {
    let mut state = self.state.lock();
    let period = state.config.mesh_period();
    let due = state
      .last_compaction
      .is_none_or(|last| last.elapsed() >= period);
    due.then(|| state.compact())
  }

  pub fn stats(&self) -> HeapStats {
    self.state.lock().stats
  }
}

#[cfg(test)]
mod tests;
