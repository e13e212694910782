use core::cell::UnsafeCell;

use super::RwSpinLock;

/// A value behind a [`RwSpinLock`]: shared access through [`read`](Self::read),
/// exclusive access through [`write`](Self::write).
///
/// The closures must not re-enter the same `Locked` value; the lock is not reentrant.
pub struct Locked<T> {
  lock: RwSpinLock,
  value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Locked<T> {}
unsafe impl<T: Send + Sync> Sync for Locked<T> {}

impl<T> Locked<T> {
  pub const fn new(value: T) -> Self {
    Self {
      lock: RwSpinLock::new(),
      value: UnsafeCell::new(value),
    }
  }

  pub fn set_sleep_time(&self, sleep_ms: u32) {
    self.lock.set_sleep_time(sleep_ms);
  }

  #[inline]
  pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
    let _guard = self.lock.read();
    f(unsafe { &*self.value.get() })
  }

  #[inline]
  pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
    let _guard = self.lock.write();
    f(unsafe { &mut *self.value.get() })
  }

  pub fn get_mut(&mut self) -> &mut T {
    self.value.get_mut()
  }

  pub fn into_inner(self) -> T {
    self.value.into_inner()
  }
}

impl<T: Default> Default for Locked<T> {
  fn default() -> Self {
    Self::new(T::default())
  }
}
