use core::{
  ops::Range,
  ptr::NonNull,
};

/// A page-aligned virtual address range handed out by a [`System`](crate::system::System).
///
/// `offset` locates the physical backing inside the system's memory file.
/// A span is `shared` once it has been aliased onto another span's backing;
/// a shared span never releases that backing on unmap.
#[derive(Debug)]
pub struct Span {
  ptr: NonNull<u8>,
  len: usize,
  offset: usize,
  shared: bool,
}

impl Span {
  /// # Safety
  ///
  /// `ptr..ptr + len` must be a live mapping of `len` bytes of the backing
  /// file at `offset`.
  pub const unsafe fn from_raw(ptr: NonNull<u8>, len: usize, offset: usize) -> Self {
    Self {
      ptr,
      len,
      offset,
      shared: false,
    }
  }

  #[inline(always)]
  pub const fn as_ptr(&self) -> *mut u8 {
    self.ptr.as_ptr()
  }

  #[inline(always)]
  pub fn base(&self) -> usize {
    self.ptr.as_ptr() as usize
  }

  #[inline(always)]
  pub const fn len(&self) -> usize {
    self.len
  }

  #[inline(always)]
  pub const fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[inline(always)]
  pub const fn offset(&self) -> usize {
    self.offset
  }

  #[inline(always)]
  pub const fn is_shared(&self) -> bool {
    self.shared
  }

  pub fn range(&self) -> Range<usize> {
    self.base()..self.base() + self.len
  }

  #[inline]
  pub fn contains(&self, addr: usize) -> bool {
    self.range().contains(&addr)
  }

  /// Byte offset of `addr` from the start of the span, if inside it.
  #[inline]
  pub fn offset_of(&self, addr: usize) -> Option<usize> {
    self.contains(addr).then(|| addr - self.base())
  }

  /// Records that this span now maps `offset` in the backing file, owned by
  /// some other span.
  pub fn rebind(&mut self, offset: usize) {
    self.offset = offset;
    self.shared = true;
  }
}

unsafe impl Send for Span {}
unsafe impl Sync for Span {}

/// A range of the backing store that no span maps any more.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "orphaned backing leaks until discarded"]
pub struct Orphan {
  pub offset: usize,
  pub len: usize,
}
