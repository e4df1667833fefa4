use meshalloc_rtree::{
  RTree,
  RTreeError,
};
use meshalloc_sys::{
  prim::{
    page_shift,
    va_size,
  },
  span::Span,
};

use crate::config::FANOUT;

#[derive(Debug, PartialEq, Eq)]
pub enum LookupError {
  Tree(RTreeError),
  RangeOverflow,
  NotFound,
}

impl From<RTreeError> for LookupError {
  fn from(err: RTreeError) -> Self {
    LookupError::Tree(err)
  }
}

pub type LookupResult<T> = Result<T, LookupError>;

/// Maps every page of every live span to the table slot of the miniheap
/// that owns it.
pub struct PageMap {
  tree: RTree<u32, FANOUT>,
  shift: usize,
}

impl PageMap {
  pub fn new() -> Self {
    let shift = page_shift();
    Self {
      tree: RTree::new(va_size() - shift),
      shift,
    }
  }

  #[inline(always)]
  fn page_of(&self, addr: usize) -> usize {
    addr >> self.shift
  }

  fn page_range(&self, span: &Span) -> LookupResult<Option<(usize, usize)>> {
    if span.is_empty() {
      return Ok(None);
    }

    let end = span
      .base()
      .checked_add(span.len())
      .ok_or(LookupError::RangeOverflow)?;
    Ok(Some((self.page_of(span.base()), self.page_of(end - 1))))
  }

  fn range_execute<F>(&self, start: usize, stop: usize, f: F) -> LookupResult<()>
  where
    F: FnMut(usize) -> LookupResult<()>,
  {
    let mut func = f;
    for page in start..=stop {
      func(page)?;
    }
    Ok(())
  }

  pub fn register(&mut self, span: &Span, owner: u32) -> LookupResult<()> {
    let Some((start, stop)) = self.page_range(span)? else {
      return Ok(());
    };

    let tree = &mut self.tree;
    let mut inserted = 0;
    let result = (start..=stop).try_for_each(|page| -> LookupResult<()> {
      tree.insert(page, owner)?;
      inserted += 1;
      Ok(())
    });

    if result.is_err() {
      for page in start..start + inserted {
        tree.remove(page);
      }
    }
    result
  }

  pub fn unregister(&mut self, span: &Span) -> LookupResult<()> {
    let Some((start, stop)) = self.page_range(span)? else {
      return Ok(());
    };

    let mut removed_any = false;
    let tree = &mut self.tree;
    for page in start..=stop {
      if tree.remove(page).is_some() {
        removed_any = true;
      }
    }

    if removed_any {
      Ok(())
    } else {
      Err(LookupError::NotFound)
    }
  }

  /// Points every page of `span` at `owner`. Every page must already be
  /// registered.
  pub fn reassign(&mut self, span: &Span, owner: u32) -> LookupResult<()> {
    let Some((start, stop)) = self.page_range(span)? else {
      return Ok(());
    };

    self.range_execute(start, stop, |page| match self.tree.lookup(page) {
      Some(_) => Ok(()),
      None => Err(LookupError::NotFound),
    })?;

    for page in start..=stop {
      self.tree.replace(page, owner)?;
    }
    Ok(())
  }

  pub fn lookup(&self, addr: usize) -> Option<u32> {
    self.tree.lookup(self.page_of(addr)).copied()
  }

  /// Number of registered pages.
  pub fn len(&self) -> usize {
    self.tree.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tree.is_empty()
  }
}

impl Default for PageMap {
  fn default() -> Self {
    Self::new()
  }
}
