use meshalloc_bitmap::{
  Bitmap,
  BitmapResult,
};
use rand::{
  Rng,
  seq::SliceRandom,
};

/// Free slot indices of one miniheap, consumed from the back.
///
/// Outside of [`Freelist::free_entire_except`] the list holds exactly the
/// clear bits of the bitmap it was attached to, in a random order.
#[derive(Debug, Default)]
pub struct Freelist {
  slots: Vec<u32>,
}

impl Freelist {
  pub const fn new() -> Self {
    Self { slots: Vec::new() }
  }

  /// Rebuilds the list from every clear bit of `bitmap`, shuffled by `rng`.
  pub fn reattach<R>(&mut self, bitmap: &Bitmap, rng: &mut R)
  where
    R: Rng + ?Sized,
  {
    self.slots.clear();
    self.slots.extend(
      (0..bitmap.bits())
        .filter(|&index| matches!(bitmap.get(index), Ok(false)))
        .map(|index| index as u32),
    );
    self.slots.shuffle(rng);
  }

  /// Leaves `keep` as the only occupied slot of `bitmap` and makes every
  /// other slot free.
  pub fn free_entire_except<R>(&mut self, bitmap: &Bitmap, keep: usize, rng: &mut R) -> BitmapResult<()>
  where
    R: Rng + ?Sized,
  {
    bitmap.get(keep)?;
    bitmap.clear_all();
    bitmap.set(keep)?;
    self.reattach(bitmap, rng);
    Ok(())
  }

  #[inline]
  pub fn pop(&mut self) -> Option<usize> {
    self.slots.pop().map(|index| index as usize)
  }

  #[inline]
  pub fn push(&mut self, index: usize) {
    self.slots.push(index as u32);
  }

  /// Drops `index` from the list. Returns whether it was present.
  pub fn remove(&mut self, index: usize) -> bool {
    let Some(pos) = self.slots.iter().position(|&slot| slot as usize == index) else {
      return false;
    };
    self.slots.swap_remove(pos);
    true
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.slots.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }

  pub fn contains(&self, index: usize) -> bool {
    self.slots.iter().any(|&slot| slot as usize == index)
  }
}

#[cfg(test)]
mod tests {
  use rand::{
    SeedableRng,
    rngs::SmallRng,
  };

  use super::*;

  #[test]
  fn test_reattach_matches_clear_bits() {
    let mut rng = SmallRng::seed_from_u64(1);
    let bitmap = Bitmap::zero(32);
    bitmap.set(3).unwrap();
    bitmap.set(17).unwrap();

    let mut list = Freelist::new();
    list.reattach(&bitmap, &mut rng);
    assert_eq!(list.len(), 30);
    assert!(!list.contains(3));
    assert!(!list.contains(17));

    let mut seen: Vec<usize> = core::iter::from_fn(|| list.pop()).collect();
    seen.sort_unstable();
    let expected: Vec<usize> = (0..32).filter(|i| *i != 3 && *i != 17).collect();
    assert_eq!(seen, expected);
  }

  #[test]
  fn test_reattach_order_is_randomized() {
    let bitmap = Bitmap::zero(64);
    let mut a = Freelist::new();
    let mut b = Freelist::new();
    a.reattach(&bitmap, &mut SmallRng::seed_from_u64(1));
    b.reattach(&bitmap, &mut SmallRng::seed_from_u64(2));
    assert_ne!(a.slots, b.slots);
  }

  #[test]
  fn test_free_entire_except() {
    let mut rng = SmallRng::seed_from_u64(9);
    let bitmap = Bitmap::zero(16);
    for index in [0, 1, 5, 9] {
      bitmap.set(index).unwrap();
    }

    let mut list = Freelist::new();
    list.free_entire_except(&bitmap, 5, &mut rng).unwrap();
    assert_eq!(bitmap.popcount(), 1);
    assert!(bitmap.get(5).unwrap());
    assert_eq!(list.len(), 15);
    assert!(!list.contains(5));

    assert!(list.free_entire_except(&bitmap, 16, &mut rng).is_err());
    assert_eq!(bitmap.popcount(), 1, "rejected index leaves state untouched");
  }

  #[test]
  fn test_remove() {
    let mut list = Freelist::new();
    list.push(4);
    list.push(8);
    assert!(list.remove(4));
    assert!(!list.remove(4));
    assert_eq!(list.pop(), Some(8));
    assert_eq!(list.pop(), None);
  }
}
