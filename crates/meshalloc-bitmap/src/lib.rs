#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{
  boxed::Box,
  vec::Vec,
};
use core::sync::atomic::{
  AtomicUsize,
  Ordering,
};


#[derive(Debug, PartialEq, Eq)]
pub enum BitmapError {
  InsufficientSize { have: usize, need: usize },
  OutOfBounds { index: usize, size: usize },
  SizeMismatch { left: usize, right: usize },
}

pub type BitmapResult<T> = Result<T, BitmapError>;

pub type BitmapWord = AtomicUsize;

const USIZE_BITS: usize = usize::BITS as usize;
const WORD_BYTES: usize = core::mem::size_of::<BitmapWord>();

/// Per-slot occupancy. Bit `i` is set iff slot `i` holds a live object.
///
/// Single-bit updates are atomic so a racing set and clear on different slots
/// of the same bitmap never lose each other, and `used` tracks the population
/// exactly because it only moves when a bit actually flips.
#[derive(Debug)]
pub struct Bitmap {
  store: Box<[BitmapWord]>,
  bits: usize,
  used: AtomicUsize,
}

impl Bitmap {
  #[inline(always)]
  pub const fn words(fields: usize) -> usize {
    fields.div_ceil(USIZE_BITS)
  }

  #[inline(always)]
  pub const fn bytes(fields: usize) -> usize {
    Self::words(fields) * WORD_BYTES
  }

  #[inline(always)]
  pub fn available(&self) -> usize {
    self.store.len() * USIZE_BITS
  }

  #[inline(always)]
  pub fn store(&self) -> &[BitmapWord] {
    &self.store
  }

  #[inline(always)]
  pub const fn bits(&self) -> usize {
    self.bits
  }

  /// Length of the raw byte view returned by [`Bitmap::to_bytes`].
  #[inline(always)]
  pub const fn byte_count(&self) -> usize {
    Self::bytes(self.bits)
  }

  const fn position(&self, index: usize) -> BitmapResult<(usize, usize)> {
    if index >= self.bits {
      return Err(BitmapError::OutOfBounds {
        index,
        size: self.bits,
      });
    }
    let word_index = index / USIZE_BITS;
    let bit_index = index % USIZE_BITS;
    Ok((word_index, bit_index))
  }

  fn with_store(bits: usize) -> Self {
    let store = (0..Self::words(bits))
      .map(|_| BitmapWord::new(0))
      .collect::<Vec<_>>()
      .into_boxed_slice();

    Self {
      store,
      bits,
      used: AtomicUsize::new(0),
    }
  }

  pub fn zero(bits: usize) -> Self {
    Self::with_store(bits)
  }

  pub fn one(bits: usize) -> Self {
    let bitmap = Self::with_store(bits);
    bitmap.set_all();
    bitmap
  }

  pub fn check(&self, fields: usize) -> BitmapResult<()> {
    let total_bits = self.available();
    if fields > total_bits {
      return Err(BitmapError::InsufficientSize {
        have: total_bits,
        need: fields,
      });
    }
    Ok(())
  }

  /// Sets bit `index`. Returns `true` if the bit was previously clear.
  #[inline]
  pub fn set(&self, index: usize) -> BitmapResult<bool> {
    let (word_index, bit_index) = self.position(index)?;
    let mask = 1usize << bit_index;
    let prev = self.store[word_index].fetch_or(mask, Ordering::AcqRel);
    let flipped = prev & mask == 0;
    if flipped {
      self.used.fetch_add(1, Ordering::Relaxed);
    }
    Ok(flipped)
  }

  /// Clears bit `index`. Returns `true` if the bit was previously set.
  #[inline]
  pub fn clear(&self, index: usize) -> BitmapResult<bool> {
    let (word_index, bit_index) = self.position(index)?;
    let mask = 1usize << bit_index;
    let prev = self.store[word_index].fetch_and(!mask, Ordering::AcqRel);
    let flipped = prev & mask != 0;
    if flipped {
      self.used.fetch_sub(1, Ordering::Relaxed);
    }
    Ok(flipped)
  }

  #[inline]
  pub fn get(&self, index: usize) -> BitmapResult<bool> {
    let (word_index, bit_index) = self.position(index)?;
    let value = self.store[word_index].load(Ordering::Acquire);
    Ok((value & (1usize << bit_index)) != 0)
  }

  pub fn clear_all(&self) {
    for word in self.store.iter() {
      word.store(0, Ordering::Release);
    }
    self.used.store(0, Ordering::Relaxed);
  }

  pub fn set_all(&self) {
    let full_words = self.bits / USIZE_BITS;

    for word in self.store[..full_words].iter() {
      word.store(usize::MAX, Ordering::Release);
    }

    let remaining_bits = self.bits % USIZE_BITS;
    if remaining_bits > 0 && full_words < self.store.len() {
      let mask = usize::MAX >> (USIZE_BITS - remaining_bits);
      self.store[full_words].store(mask, Ordering::Release);
    }
    self.used.store(self.bits, Ordering::Relaxed);
  }

  pub fn find_fs(&self) -> Option<usize> {
    for (word_index, word) in self.store.iter().enumerate() {
      let value = word.load(Ordering::Acquire);
      if value != 0 {
        let bit_offset = value.trailing_zeros() as usize;
        let global_index = word_index * USIZE_BITS + bit_offset;
        if global_index < self.bits {
          return Some(global_index);
        }
      }
    }
    None
  }

  pub fn find_fc(&self) -> Option<usize> {
    for (word_index, word) in self.store.iter().enumerate() {
      let inverted = !word.load(Ordering::Acquire);
      if inverted != 0 {
        let bit_offset = inverted.trailing_zeros() as usize;
        let global_index = word_index * USIZE_BITS + bit_offset;
        if global_index < self.bits {
          return Some(global_index);
        }
      }
    }
    None
  }

  /// Number of set bits.
  #[inline]
  pub fn popcount(&self) -> usize {
    self.used.load(Ordering::Relaxed)
  }

  /// Recounts the population from the words themselves.
  pub fn recount(&self) -> usize {
    self
      .store
      .iter()
      .map(|word| word.load(Ordering::Acquire).count_ones() as usize)
      .sum()
  }

  #[inline]
  pub fn is_clear(&self) -> bool {
    self.popcount() == 0
  }

  #[inline]
  pub fn one_clear(&self) -> bool {
    self.popcount() < self.bits
  }

  /// Indices of every set bit, in ascending order, taken from a snapshot of
  /// the words at the time of the call.
  pub fn iter_set(&self) -> SetBits {
    SetBits {
      words: self.snapshot(),
      word_index: 0,
      current: 0,
      bits: self.bits,
      started: false,
    }
  }

  /// Little-endian byte view of the occupancy words, `byte_count()` long.
  pub fn to_bytes(&self) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(self.byte_count());
    for word in self.store.iter() {
      bytes.extend_from_slice(&word.load(Ordering::Acquire).to_le_bytes());
    }
    bytes
  }

  fn snapshot(&self) -> Box<[usize]> {
    self
      .store
      .iter()
      .map(|word| word.load(Ordering::Acquire))
      .collect()
  }

  fn same_shape(&self, other: &Bitmap) -> BitmapResult<()> {
    if self.bits != other.bits {
      return Err(BitmapError::SizeMismatch {
        left: self.bits,
        right: other.bits,
      });
    }
    Ok(())
  }

  /// True when no index is set in both bitmaps.
  pub fn meshable_with(&self, other: &Bitmap) -> BitmapResult<bool> {
    self.same_shape(other)?;
    Ok(
      self
        .store
        .iter()
        .zip(other.store.iter())
        .all(|(a, b)| a.load(Ordering::Acquire) & b.load(Ordering::Acquire) == 0),
    )
  }

  /// ORs `other` into `self`.
  pub fn merge(&self, other: &Bitmap) -> BitmapResult<()> {
    self.same_shape(other)?;
    for (dst, src) in self.store.iter().zip(other.store.iter()) {
      dst.fetch_or(src.load(Ordering::Acquire), Ordering::AcqRel);
    }
    self.used.store(self.recount(), Ordering::Relaxed);
    Ok(())
  }
}

pub struct SetBits {
  words: Box<[usize]>,
  word_index: usize,
  current: usize,
  bits: usize,
  started: bool,
}

impl Iterator for SetBits {
  type Item = usize;

  fn next(&mut self) -> Option<usize> {
    if !self.started {
      self.started = true;
      self.current = self.words.first().copied().unwrap_or(0);
    }

    loop {
      if self.current != 0 {
        let bit = self.current.trailing_zeros() as usize;
        self.current &= self.current - 1;
        let index = self.word_index * USIZE_BITS + bit;
        return (index < self.bits).then_some(index);
      }

      self.word_index += 1;
      if self.word_index >= self.words.len() {
        return None;
      }
      self.current = self.words[self.word_index];
    }
  }
}

/// Byte-wise meshability over two raw occupancy views: true iff the AND of
/// every byte pair is zero.
///
/// # Panics
///
/// Panics when the two views differ in length.
pub fn bitmaps_meshable(left: &[u8], right: &[u8]) -> bool {
  assert_eq!(
    left.len(),
    right.len(),
    "meshability compared bitmaps of different byte counts"
  );
  left.iter().zip(right.iter()).all(|(a, b)| a & b == 0)
}
