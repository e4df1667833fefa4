use meshalloc_bitmap::BitmapError;
#[cfg(unix)]
use meshalloc_sync::quiesce::QuiesceError;
use meshalloc_sys::system::SysError;

use crate::lookup::LookupError;

pub mod classes;
pub mod config;
pub mod freelist;
pub mod global;
pub mod lookup;
mod mesh;
pub mod miniheap;
pub mod stats;

#[derive(Debug, PartialEq, Eq)]
pub enum HeapError {
  TooLarge { size: usize, max: usize },
  ZeroSize,
  System(SysError),
  Lookup(LookupError),
  Bitmap(BitmapError),
  #[cfg(unix)]
  Quiesce(QuiesceError),
}

pub type HeapResult<T> = Result<T, HeapError>;

impl From<SysError> for HeapError {
  fn from(err: SysError) -> Self {
    HeapError::System(err)
  }
}

impl From<LookupError> for HeapError {
  fn from(err: LookupError) -> Self {
    HeapError::Lookup(err)
  }
}

impl From<BitmapError> for HeapError {
  fn from(err: BitmapError) -> Self {
    HeapError::Bitmap(err)
  }
}

#[cfg(unix)]
impl From<QuiesceError> for HeapError {
  fn from(err: QuiesceError) -> Self {
    HeapError::Quiesce(err)
  }
}

pub mod prelude {
  pub use super::{
    HeapError,
    HeapResult,
    config::HeapConfig,
    global::{
      GlobalHeap,
      MiniHeapId,
    },
    miniheap::MiniHeap,
    stats::{
      CompactionReport,
      HeapStats,
    },
  };
}
