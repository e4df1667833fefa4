use core::ptr::NonNull;

use getset::CopyGetters;
use meshalloc_bitmap::{
  Bitmap,
  BitmapResult,
};
use meshalloc_sys::span::Span;
use rand::Rng;

use crate::{
  classes::SizeClassIndex,
  freelist::Freelist,
};

/// A span of `max_count` equal slots of `object_size` bytes.
///
/// The primary span is where new objects are handed out. Spans of miniheaps
/// that were meshed into this one stay mapped in `meshed`, aliasing the
/// primary span's backing, so pointers into them keep resolving here.
#[derive(Debug, CopyGetters)]
pub struct MiniHeap {
  #[getset(get_copy = "pub")]
  object_size: usize,
  #[getset(get_copy = "pub")]
  max_count: usize,
  /// Size class this miniheap serves through `allocate`; `None` when it is
  /// owned by whoever called `alloc_miniheap`.
  #[getset(get_copy = "pub")]
  class: Option<SizeClassIndex>,
  span: Span,
  meshed: Vec<Span>,
  bitmap: Bitmap,
  freelist: Freelist,
}

impl MiniHeap {
  pub fn new<R>(
    span: Span,
    object_size: usize,
    max_count: usize,
    class: Option<SizeClassIndex>,
    rng: &mut R,
  ) -> Self
  where
    R: Rng + ?Sized,
  {
    debug_assert!(span.len() >= object_size * max_count);
    let bitmap = Bitmap::zero(max_count);
    let mut freelist = Freelist::new();
    freelist.reattach(&bitmap, rng);

    Self {
      object_size,
      max_count,
      class,
      span,
      meshed: Vec::new(),
      bitmap,
      freelist,
    }
  }

  #[inline(always)]
  pub fn base(&self) -> usize {
    self.span.base()
  }

  #[inline(always)]
  pub fn span(&self) -> &Span {
    &self.span
  }

  pub fn meshed(&self) -> &[Span] {
    &self.meshed
  }

  /// The primary span followed by every span meshed into it.
  pub fn spans(&self) -> impl Iterator<Item = &Span> {
    core::iter::once(&self.span).chain(self.meshed.iter())
  }

  #[inline(always)]
  pub fn bitmap(&self) -> &Bitmap {
    &self.bitmap
  }

  #[inline]
  pub fn in_use_count(&self) -> usize {
    self.bitmap.popcount()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.bitmap.is_clear()
  }

  #[inline]
  pub fn is_full(&self) -> bool {
    !self.bitmap.one_clear()
  }

  pub fn occupancy(&self) -> f64 {
    self.in_use_count() as f64 / self.max_count as f64
  }

  pub fn free_slots(&self) -> usize {
    self.freelist.len()
  }

  #[inline]
  fn slot_ptr(&self, index: usize) -> NonNull<u8> {
    let addr = self.span.as_ptr().wrapping_add(index * self.object_size);
    // SAFETY: `index < max_count` and the span holds `max_count` slots.
    unsafe { NonNull::new_unchecked(addr) }
  }

  /// Address of slot `index` in the primary span.
  pub fn address_of(&self, index: usize) -> Option<NonNull<u8>> {
    (index < self.max_count).then(|| self.slot_ptr(index))
  }

  /// Slot index of `addr` in any span of this miniheap. Interior pointers
  /// resolve to the slot that contains them.
  pub fn slot_of(&self, addr: usize) -> Option<usize> {
    let offset = self.spans().find_map(|span| span.offset_of(addr))?;
    let index = offset / self.object_size;
    (index < self.max_count).then_some(index)
  }

  pub fn contains(&self, addr: usize) -> bool {
    self.slot_of(addr).is_some()
  }

  /// Marks slot `index` occupied and returns its address.
  ///
  /// # Panics
  ///
  /// Panics if `index` is out of range or the slot is already occupied.
  pub fn malloc_at(&mut self, index: usize) -> NonNull<u8> {
    match self.bitmap.set(index) {
      Ok(true) => {}
      Ok(false) => panic!("malloc_at: slot {index} is already occupied"),
      Err(err) => panic!("malloc_at: slot {index} outside miniheap: {err:?}"),
    }
    self.freelist.remove(index);
    self.slot_ptr(index)
  }

  /// Hands out a free slot, or `None` when the miniheap is exhausted.
  pub fn malloc(&mut self) -> Option<NonNull<u8>> {
    while let Some(index) = self.freelist.pop() {
      if let Ok(true) = self.bitmap.set(index) {
        return Some(self.slot_ptr(index));
      }
    }
    None
  }

  /// Releases the slot holding `addr`.
  ///
  /// # Panics
  ///
  /// Panics if `addr` is not inside this miniheap or its slot is not live.
  pub fn free(&mut self, addr: usize) {
    let Some(index) = self.slot_of(addr) else {
      panic!("free: {addr:#x} is not inside miniheap at {:#x}", self.base());
    };
    match self.bitmap.clear(index) {
      Ok(true) => self.freelist.push(index),
      Ok(false) => panic!("free: double free of {addr:#x} (slot {index})"),
      Err(err) => panic!("free: slot {index} outside miniheap: {err:?}"),
    }
  }

  pub fn reattach<R>(&mut self, rng: &mut R)
  where
    R: Rng + ?Sized,
  {
    self.freelist.reattach(&self.bitmap, rng);
  }

  /// Frees every slot except the one holding `addr`, which becomes the only
  /// live object.
  pub fn free_entire_except<R>(&mut self, addr: usize, rng: &mut R) -> BitmapResult<()>
  where
    R: Rng + ?Sized,
  {
    let Some(index) = self.slot_of(addr) else {
      panic!("free_entire_except: {addr:#x} is not inside miniheap at {:#x}", self.base());
    };
    self.freelist.free_entire_except(&self.bitmap, index, rng)
  }

  /// True when both miniheaps have the same slot layout and no slot is live
  /// in both.
  pub fn meshable_with(&self, other: &MiniHeap) -> bool {
    self.object_size == other.object_size
      && self.max_count == other.max_count
      && self.span.len() == other.span.len()
      && matches!(self.bitmap.meshable_with(&other.bitmap), Ok(true))
  }

  /// Copies every live slot of `other` to the same slot of `self`.
  ///
  /// # Safety
  ///
  /// No thread may access either miniheap's objects during the copy, and the
  /// two must be meshable.
  pub(crate) unsafe fn copy_live_from(&self, other: &MiniHeap) {
    for index in 0..other.max_count {
      if matches!(other.bitmap.get(index), Ok(true)) {
        let src = other.slot_ptr(index).as_ptr();
        let dst = self.slot_ptr(index).as_ptr();
        unsafe { core::ptr::copy_nonoverlapping(src, dst, self.object_size) };
      }
    }
  }

  pub(crate) fn span_mut(&mut self) -> &mut Span {
    &mut self.span
  }

  pub(crate) fn meshed_mut(&mut self) -> &mut [Span] {
    &mut self.meshed
  }

  /// Takes over `spans` after their owner was meshed into this miniheap.
  pub(crate) fn adopt(&mut self, spans: impl IntoIterator<Item = Span>) {
    self.meshed.extend(spans);
  }

  /// Consumes the miniheap, returning its spans primary-last so callers can
  /// unmap aliases before the span that owns the backing.
  pub(crate) fn into_spans(self) -> impl Iterator<Item = Span> {
    self.meshed.into_iter().chain(core::iter::once(self.span))
  }
}
