use core::{
  hint,
  sync::atomic::{AtomicBool, AtomicU32, Ordering},
};
use std::thread;

use super::backoff;

const DEFAULT_BUSY_WAIT_TRIES: u32 = 50;

/// Mutual-exclusion spinlock: a bounded number of busy-wait attempts, then attempts
/// separated by a sleep (or a yield when the sleep time is zero).
pub struct SpinLock {
  locked: AtomicBool,
  sleep_ms: AtomicU32,
  busy_wait_tries: AtomicU32,
}

impl SpinLock {
  pub const fn new() -> Self {
    Self::with_backoff(0, DEFAULT_BUSY_WAIT_TRIES)
  }

  pub const fn with_backoff(sleep_ms: u32, busy_wait_tries: u32) -> Self {
    Self {
      locked: AtomicBool::new(false),
      sleep_ms: AtomicU32::new(sleep_ms),
      busy_wait_tries: AtomicU32::new(busy_wait_tries),
    }
  }

  #[inline]
  pub fn lock(&self) -> SpinLockGuard<'_> {
    let mut tries = self.busy_wait_tries.load(Ordering::Relaxed);
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      if tries > 0 {
        tries -= 1;
        while self.locked.load(Ordering::Relaxed) && tries > 0 {
          tries -= 1;
          hint::spin_loop();
        }
      } else {
        match self.sleep_ms.load(Ordering::Relaxed) {
          0 => thread::yield_now(),
          ms => backoff(ms),
        }
      }
    }
    SpinLockGuard { lock: self }
  }

  /// Never blocks.
  #[inline]
  pub fn try_lock(&self) -> Option<SpinLockGuard<'_>> {
    self
      .locked
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .ok()
      .map(|_| SpinLockGuard { lock: self })
  }

  pub fn is_locked(&self) -> bool {
    self.locked.load(Ordering::Relaxed)
  }

  pub fn set_sleep_time(&self, sleep_ms: u32) {
    self.sleep_ms.store(sleep_ms, Ordering::Relaxed);
  }

  pub fn set_busy_wait_tries(&self, busy_wait_tries: u32) {
    self
      .busy_wait_tries
      .store(busy_wait_tries, Ordering::Relaxed);
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

impl Default for SpinLock {
  fn default() -> Self {
    Self::new()
  }
}

/// Releases the [`SpinLock`] when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SpinLockGuard<'a> {
  lock: &'a SpinLock,
}

impl Drop for SpinLockGuard<'_> {
  fn drop(&mut self) {
    self.lock.unlock();
  }
}
