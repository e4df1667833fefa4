//! A meshing allocator runtime: fixed-size-slot miniheaps whose sparse pairs
//! are periodically merged onto shared physical pages.
//!
//! The process has one [`Runtime`], built by [`init`] or lazily by
//! [`runtime`]. It lives until the process exits; its spans are never
//! unmapped while pointers into them may still exist.
//!
//! Threads that touch heap objects while a compaction may run must be
//! started through [`spawn`] or [`create_thread`], or hold a
//! [`Registration`](meshalloc_sync::quiesce::Registration).

use core::ptr::NonNull;

use meshalloc_heap::{
  HeapResult,
  config::HeapConfig,
  global::GlobalHeap,
  stats::{
    CompactionReport,
    HeapStats,
  },
};
use spin::Once;

#[cfg(unix)]
pub use meshalloc_sync::quiesce::{
  create_thread,
  spawn,
};

pub mod prelude {
  pub use meshalloc_bitmap::Bitmap;
  pub use meshalloc_heap::prelude::*;
  #[cfg(unix)]
  pub use meshalloc_sync::quiesce::{
    Registration,
    create_thread,
    spawn,
  };
  pub use meshalloc_sys::prelude::*;

  pub use super::{
    Runtime,
    init,
    runtime,
  };
}

pub struct Runtime {
  heap: GlobalHeap,
}

static RUNTIME: Once<Runtime> = Once::new();

/// Builds the process runtime with `config`. Later calls return the runtime
/// that already exists and ignore their argument.
pub fn init(config: HeapConfig) -> HeapResult<&'static Runtime> {
  RUNTIME.try_call_once(|| {
    let heap = GlobalHeap::new(config)?;
    tracing::debug!(?config, "meshalloc runtime initialized");
    Ok(Runtime { heap })
  })
}

/// The process runtime, configured from the environment on first use.
pub fn runtime() -> HeapResult<&'static Runtime> {
  match RUNTIME.get() {
    Some(runtime) => Ok(runtime),
    None => init(HeapConfig::from_env()),
  }
}

impl Runtime {
  pub fn heap(&self) -> &GlobalHeap {
    &self.heap
  }

  /// Null when `size` has no size class or the OS refuses a new span.
  pub fn allocate(&self, size: usize) -> *mut u8 {
    match self.heap.allocate(size) {
      Ok(ptr) => ptr.as_ptr(),
      Err(err) => {
        tracing::trace!(size, ?err, "allocation failed");
        core::ptr::null_mut()
      }
    }
  }

  /// Frees `ptr`. Null is ignored.
  ///
  /// # Panics
  ///
  /// Panics on a double free or a pointer this runtime never handed out.
  pub fn deallocate(&self, ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
      self.heap.deallocate(ptr);
    }
  }

  /// Entry point for a periodic compaction scheduler.
  pub fn compact(&self) -> CompactionReport {
    self.heap.compact()
  }

  pub fn maybe_compact(&self) -> Option<CompactionReport> {
    self.heap.maybe_compact()
  }

  pub fn stats(&self) -> HeapStats {
    self.heap.stats()
  }
}
