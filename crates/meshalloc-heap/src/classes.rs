use meshalloc_sys::prim::{
  PrimResult,
  page_align,
};

use crate::config::{
  MAX_OBJECTS,
  MAX_SIZE,
  MIN_OBJECTS,
  NCLASSES,
  QUANTUM,
  SPAN_TARGET,
};

/// Index of a `QUANTUM`-spaced size class. Class `i` serves objects of
/// `(i + 1) * QUANTUM` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SizeClassIndex(usize);

impl SizeClassIndex {
  pub const fn for_size(size: usize) -> Option<Self> {
    if size > MAX_SIZE {
      return None;
    }
    let rounded = if size == 0 { QUANTUM } else { size };
    Some(Self(rounded.div_ceil(QUANTUM) - 1))
  }

  pub const fn from_index(index: usize) -> Option<Self> {
    if index < NCLASSES {
      Some(Self(index))
    } else {
      None
    }
  }

  #[inline(always)]
  pub const fn index(&self) -> usize {
    self.0
  }

  #[inline(always)]
  pub const fn object_size(&self) -> usize {
    (self.0 + 1) * QUANTUM
  }

  pub fn iter() -> impl Iterator<Item = SizeClassIndex> {
    (0..NCLASSES).map(SizeClassIndex)
  }
}

/// Slots per miniheap for `object_size`: as many as fit in `SPAN_TARGET`,
/// clamped to `[MIN_OBJECTS, MAX_OBJECTS]`.
pub const fn max_count(object_size: usize) -> usize {
  let fit = SPAN_TARGET / object_size;
  if fit < MIN_OBJECTS {
    MIN_OBJECTS
  } else if fit > MAX_OBJECTS {
    MAX_OBJECTS
  } else {
    fit
  }
}

pub fn span_size(object_size: usize) -> PrimResult<usize> {
  page_align(max_count(object_size) * object_size)
}
