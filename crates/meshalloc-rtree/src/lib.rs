#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;

#[derive(Debug, PartialEq, Eq)]
pub enum RTreeError {
  AlreadyPresent,
  KeyTooLarge { key: usize, bits: usize },
}

pub type RTreeResult<T> = Result<T, RTreeError>;

struct RNode<T, const FANOUT: usize> {
  value: Option<T>,
  children: [Option<Box<RNode<T, FANOUT>>>; FANOUT],
  occupied: usize,
}

impl<T, const FANOUT: usize> RNode<T, FANOUT> {
  fn new() -> Box<Self> {
    Box::new(Self {
      value: None,
      children: core::array::from_fn(|_| None),
      occupied: 0,
    })
  }

  #[inline(always)]
  fn child(&self, idx: usize) -> Option<&RNode<T, FANOUT>> {
    self.children[idx].as_deref()
  }

  #[inline(always)]
  fn child_mut(&mut self, idx: usize) -> Option<&mut RNode<T, FANOUT>> {
    self.children[idx].as_deref_mut()
  }

  fn ensure_child(&mut self, idx: usize) -> &mut RNode<T, FANOUT> {
    let slot = &mut self.children[idx];
    if slot.is_none() {
      self.occupied += 1;
    }
    slot.get_or_insert_with(Self::new)
  }

  fn is_vacant(&self) -> bool {
    self.value.is_none() && self.occupied == 0
  }
}

/// Radix tree over `key_bits`-wide integer keys, `log2(FANOUT)` bits per
/// level. Interior nodes are pruned as soon as their last entry is removed.
pub struct RTree<T, const FANOUT: usize> {
  root: Option<Box<RNode<T, FANOUT>>>,
  key_bits: usize,
  len: usize,
}

impl<T, const FANOUT: usize> RTree<T, FANOUT> {
  const BPL: usize = FANOUT.trailing_zeros() as usize;
  const MASK: usize = FANOUT - 1;

  pub const fn new(key_bits: usize) -> Self {
    assert!(FANOUT.is_power_of_two() && FANOUT > 1);
    assert!(key_bits > 0 && key_bits <= usize::BITS as usize);
    Self {
      root: None,
      key_bits,
      len: 0,
    }
  }

  #[inline(always)]
  const fn levels(&self) -> usize {
    self.key_bits.div_ceil(Self::BPL)
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
  const fn index_for(&self, key: usize, level: usize) -> usize {
    let shift = (self.levels() - 1 - level) * Self::BPL;
    (key >> shift) & Self::MASK
  }

  fn validate(&self, key: usize) -> RTreeResult<()> {
    if self.key_bits < usize::BITS as usize && key >> self.key_bits != 0 {
      return Err(RTreeError::KeyTooLarge {
        key,
        bits: self.key_bits,
      });
    }
    Ok(())
  }

  fn leaf(&self, key: usize) -> Option<&RNode<T, FANOUT>> {
    self.validate(key).ok()?;
    let mut current = self.root.as_deref()?;
    for level in 0..self.levels() {
      current = current.child(self.index_for(key, level))?;
    }
    Some(current)
  }

  fn leaf_mut(&mut self, key: usize) -> Option<&mut RNode<T, FANOUT>> {
    self.validate(key).ok()?;
    let levels = self.levels();
    let indices: [usize; usize::BITS as usize] = core::array::from_fn(|level| {
      if level < levels {
        self.index_for(key, level)
      } else {
        0
      }
    });

    let mut current = self.root.as_deref_mut()?;
    for idx in indices.iter().take(levels) {
      current = current.child_mut(*idx)?;
    }
    Some(current)
  }

  fn ensure_leaf(&mut self, key: usize) -> RTreeResult<&mut RNode<T, FANOUT>> {
    self.validate(key)?;
    let levels = self.levels();
    let indices: [usize; usize::BITS as usize] = core::array::from_fn(|level| {
      if level < levels {
        self.index_for(key, level)
      } else {
        0
      }
    });

    let mut current = &mut **self.root.get_or_insert_with(RNode::new);
    for idx in indices.iter().take(levels) {
      current = current.ensure_child(*idx);
    }
    Ok(current)
  }

  pub fn insert(&mut self, key: usize, val: T) -> RTreeResult<()> {
    let leaf = self.ensure_leaf(key)?;
    if leaf.value.is_some() {
      return Err(RTreeError::AlreadyPresent);
    }
    leaf.value = Some(val);
    self.len += 1;
    Ok(())
  }

  /// Inserts or overwrites, returning the previous value.
  pub fn replace(&mut self, key: usize, val: T) -> RTreeResult<Option<T>> {
    let leaf = self.ensure_leaf(key)?;
    let prev = leaf.value.replace(val);
    if prev.is_none() {
      self.len += 1;
    }
    Ok(prev)
  }

  pub fn lookup(&self, key: usize) -> Option<&T> {
    self.leaf(key)?.value.as_ref()
  }

  pub fn lookup_mut(&mut self, key: usize) -> Option<&mut T> {
    self.leaf_mut(key)?.value.as_mut()
  }

  pub fn remove(&mut self, key: usize) -> Option<T> {
    self.validate(key).ok()?;
    let levels = self.levels();
    let mut path = [0usize; usize::BITS as usize];
    for (level, slot) in path.iter_mut().enumerate().take(levels) {
      *slot = self.index_for(key, level);
    }

    let root = self.root.as_deref_mut()?;
    let val = Self::remove_at(root, &path[..levels])?;
    if root.is_vacant() {
      self.root = None;
    }
    self.len -= 1;
    Some(val)
  }

  fn remove_at(node: &mut RNode<T, FANOUT>, path: &[usize]) -> Option<T> {
    let Some((&idx, rest)) = path.split_first() else {
      return node.value.take();
    };

    let child = node.child_mut(idx)?;
    let val = Self::remove_at(child, rest)?;
    if child.is_vacant() {
      node.children[idx] = None;
      node.occupied -= 1;
    }
    Some(val)
  }
}
