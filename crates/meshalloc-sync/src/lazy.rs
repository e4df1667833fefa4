use core::{
  cell::UnsafeCell,
  mem::ManuallyDrop,
  ops::Deref,
};

use spin::Once;

struct Data<T, F> {
  value: ManuallyDrop<Option<T>>,
  f: ManuallyDrop<F>,
}

/// A value computed on first access. `const`-constructible, so it can back a
/// `static` without `std::sync`.
pub struct LazyLock<T, F = fn() -> T> {
  once: Once,
  data: UnsafeCell<Data<T, F>>,
}

impl<T, F> LazyLock<T, F>
where
  F: FnOnce() -> T,
{
  pub const fn new(f: F) -> Self {
    Self {
      once: Once::new(),
      data: UnsafeCell::new(Data {
        f: ManuallyDrop::new(f),
        value: ManuallyDrop::new(None),
      }),
    }
  }

  pub fn force(this: &LazyLock<T, F>) -> &T {
    this.once.call_once(|| {
      let data = unsafe { &mut *this.data.get() };
      let f = unsafe { ManuallyDrop::take(&mut data.f) };
      data.value = ManuallyDrop::new(Some(f()));
    });

    let data = unsafe { &*this.data.get() };
    match data.value.as_ref() {
      Some(value) => value,
      None => unreachable!("LazyLock initializer completed without a value"),
    }
  }

  /// The value, if some thread already forced it.
  pub fn get(this: &LazyLock<T, F>) -> Option<&T> {
    this.once.get()?;
    let data = unsafe { &*this.data.get() };
    data.value.as_ref()
  }
}

impl<T, F> Deref for LazyLock<T, F>
where
  F: FnOnce() -> T,
{
  type Target = T;
  fn deref(&self) -> &Self::Target {
    Self::force(self)
  }
}

unsafe impl<T, F> Sync for LazyLock<T, F>
where
  T: Sync + Send,
  F: Send + FnOnce() -> T,
{
}
unsafe impl<T, F> Send for LazyLock<T, F>
where
  T: Send,
  F: Send + FnOnce() -> T,
{
}
