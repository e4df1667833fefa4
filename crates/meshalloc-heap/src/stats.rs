use getset::CopyGetters;

/// Counters kept by a [`GlobalHeap`](crate::global::GlobalHeap) since it was
/// created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct HeapStats {
  miniheaps_created: usize,
  miniheaps_freed: usize,
  meshes: usize,
  meshes_refused: usize,
  /// Bytes of backing returned to the OS by meshing.
  bytes_released: usize,
  compactions: usize,
}

impl HeapStats {
  pub fn live_miniheaps(&self) -> usize {
    self.miniheaps_created - self.miniheaps_freed - self.meshes
  }

  pub(crate) fn created(&mut self) {
    self.miniheaps_created += 1;
  }

  pub(crate) fn freed(&mut self) {
    self.miniheaps_freed += 1;
  }

  pub(crate) fn meshed(&mut self, released: usize) {
    self.meshes += 1;
    self.bytes_released += released;
  }

  pub(crate) fn refused(&mut self) {
    self.meshes_refused += 1;
  }

  pub(crate) fn compacted(&mut self) {
    self.compactions += 1;
  }
}

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct CompactionReport {
  /// Empty pooled miniheaps that were unmapped.
  reclaimed: usize,
  meshed: usize,
  refused: usize,
  bytes_released: usize,
}

impl CompactionReport {
  pub(crate) fn reclaim(&mut self) {
    self.reclaimed += 1;
  }

  pub(crate) fn mesh(&mut self, released: usize) {
    self.meshed += 1;
    self.bytes_released += released;
  }

  pub(crate) fn refuse(&mut self) {
    self.refused += 1;
  }
}
