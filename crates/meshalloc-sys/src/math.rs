pub const fn is_aligned(value: usize, align: usize) -> Option<bool> {
  if !align.is_power_of_two() {
    return None;
  }
  Some((value & (align - 1)) == 0)
}

pub const fn align_up(value: usize, align: usize) -> Option<usize> {
  if !align.is_power_of_two() {
    return None;
  }

  let mask = align - 1;
  match value.checked_add(mask) {
    Some(sum) => Some(sum & !mask),
    None => None,
  }
}

pub const fn align_down(value: usize, align: usize) -> Option<usize> {
  if !align.is_power_of_two() {
    return None;
  }

  Some(value & !(align - 1))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_is_aligned() {
    assert_eq!(is_aligned(0, 8), Some(true));
    assert_eq!(is_aligned(1, 1), Some(true));
    assert_eq!(is_aligned(1, 2), Some(false));
    assert_eq!(is_aligned(16, 16), Some(true));
    assert_eq!(is_aligned(17, 16), Some(false));
    assert_eq!(is_aligned(100, 3), None);
  }

  #[test]
  fn test_align_up() {
    assert_eq!(align_up(0, 16), Some(0));
    assert_eq!(align_up(1, 16), Some(16));
    assert_eq!(align_up(16, 16), Some(16));
    assert_eq!(align_up(17, 16), Some(32));
    assert_eq!(align_up(4095, 4096), Some(4096));
    assert_eq!(align_up(100, 6), None);
    assert_eq!(align_up(usize::MAX, 8), None);
  }

  #[test]
  fn test_align_down() {
    assert_eq!(align_down(0, 8), Some(0));
    assert_eq!(align_down(7, 8), Some(0));
    assert_eq!(align_down(15, 8), Some(8));
    assert_eq!(align_down(8191, 4096), Some(4096));
    assert_eq!(align_down(100, 3), None);
  }
}
