use alloc::boxed::Box;

use crate::span::{
  Orphan,
  Span,
};

#[derive(Debug, PartialEq, Eq)]
pub enum SysError {
  Unsupported,
  OutOfMemory,
  InvalidArgument,
  Os(i32),
}

pub type SysResult<T> = Result<T, SysError>;

/// Virtual memory backend for miniheap spans.
///
/// Every span is a shared mapping of a range of one backing store, which is
/// what lets two virtual ranges resolve to the same physical pages.
///
/// # Safety
///
/// Implementors must ensure that:
/// - `alloc` returns a page-aligned, readable and writable span whose backing
///   is not mapped by any other live span
/// - after `alias(target, source)` every byte of `target` reads and writes the
///   same storage as the byte at the same offset of `source`
/// - `dealloc` never releases backing that a span other than the one passed
///   in still maps
pub unsafe trait System
where
  Self: Send + Sync,
{
  /// Maps a fresh span of `size` bytes. `size` must be page aligned.
  fn alloc(&self, size: usize) -> SysResult<Span> {
    _ = size;
    Err(SysError::Unsupported)
  }

  /// Remaps `target` so it aliases the backing of `source`. Returns the
  /// backing `target` used to own, which the caller hands to `discard` once
  /// no thread can still be reading it through a stale translation.
  ///
  /// # Safety
  ///
  /// Both spans must come from this system and be live. Any data held only in
  /// `target`'s old backing is lost, and no thread may access `target` while
  /// the remap is in progress.
  unsafe fn alias(&self, target: &mut Span, source: &Span) -> SysResult<Option<Orphan>> {
    _ = (target, source);
    Err(SysError::Unsupported)
  }

  /// Returns orphaned backing to the operating system and makes its range
  /// available to later `alloc` calls.
  fn discard(&self, orphan: Orphan) {
    _ = orphan;
  }

  /// Unmaps `span`, releasing its backing unless the span is shared.
  ///
  /// # Safety
  ///
  /// `span` must come from this system and must not be accessed afterwards.
  unsafe fn dealloc(&self, span: Span) -> SysResult<()> {
    _ = span;
    Err(SysError::Unsupported)
  }
}

pub struct UnsupportedSystem {}
unsafe impl System for UnsupportedSystem {}

/// The aliasing backend for this platform.
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub fn default_system() -> SysResult<Box<dyn System>> {
  Ok(Box::new(crate::unix::UnixSystem::new()?))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn default_system() -> SysResult<Box<dyn System>> {
  Ok(Box::new(UnsupportedSystem {}))
}
