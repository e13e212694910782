use core::sync::atomic::{AtomicU32, Ordering};

use super::backoff;
use crate::error::{AllocError, Result};

// High 12 bits count writers, low 20 bits count readers.
const WRITER_UNIT: u32 = 1 << 20;
const WRITER_MASK: u32 = 0xFFF0_0000;
const READER_MASK: u32 = 0x000F_FFFF;

const _: () = assert!(WRITER_MASK & READER_MASK == 0);
const _: () = assert!(WRITER_MASK | READER_MASK == u32::MAX);
const _: () = assert!(WRITER_UNIT & WRITER_MASK == WRITER_UNIT);

/// Read-write spinlock over a single atomic word.
///
/// Any number of readers (up to 2^20 - 1) may hold the lock together; a writer excludes
/// everyone else. Waiting is a busy loop, optionally sleeping `sleep_ms` between attempts.
///
/// There is no fairness policy: a steady stream of writers can starve readers, and a
/// writer that has claimed the writer slot waits for as long as readers keep holding.
pub struct RwSpinLock {
  state: AtomicU32,
  sleep_ms: AtomicU32,
}

impl RwSpinLock {
  pub const fn new() -> Self {
    Self::with_sleep_time(0)
  }

  pub const fn with_sleep_time(sleep_ms: u32) -> Self {
    Self {
      state: AtomicU32::new(0),
      sleep_ms: AtomicU32::new(sleep_ms),
    }
  }

  #[inline]
  fn pause(&self) {
    backoff(self.sleep_ms.load(Ordering::Relaxed));
  }

  // === Read side ===

  pub fn lock_read(&self) {
    loop {
      while self.state.load(Ordering::Relaxed) & WRITER_MASK != 0 {
        self.pause();
      }

      // A writer may have slipped in between the check and the increment.
      let prev = self.state.fetch_add(1, Ordering::Acquire);
      if prev & WRITER_MASK == 0 {
        return;
      }
      self.state.fetch_sub(1, Ordering::Relaxed);
    }
  }

  pub fn try_lock_read(&self) -> bool {
    let prev = self.state.fetch_add(1, Ordering::Acquire);
    if prev & WRITER_MASK == 0 {
      return true;
    }
    self.state.fetch_sub(1, Ordering::Relaxed);
    false
  }

  pub fn unlock_read(&self) -> Result<()> {
    self
      .state
      .fetch_update(Ordering::Release, Ordering::Relaxed, |state| {
        (state & READER_MASK != 0).then(|| state - 1)
      })
      .map(|_| ())
      .map_err(|_| AllocError::WrongState("There are no read locks"))
  }

  pub fn is_locked_read(&self) -> bool {
    self.state.load(Ordering::Relaxed) & READER_MASK != 0
  }

  // === Write side ===

  pub fn lock_write(&self) {
    loop {
      let state = self.state.load(Ordering::Relaxed);
      if state & WRITER_MASK != 0 {
        self.pause();
        continue;
      }

      if self
        .state
        .compare_exchange_weak(
          state,
          state + WRITER_UNIT,
          Ordering::Acquire,
          Ordering::Relaxed,
        )
        .is_ok()
      {
        // New readers are now locked out; wait for the present ones to leave.
        while self.state.load(Ordering::Acquire) & READER_MASK != 0 {
          self.pause();
        }
        return;
      }
    }
  }

  /// Succeeds only from the fully unlocked state, so a single reader is enough to make
  /// it fail. This is stricter than [`lock_write`](Self::lock_write), which claims the
  /// writer slot first and then waits for readers to drain.
  pub fn try_lock_write(&self) -> bool {
    self
      .state
      .compare_exchange(0, WRITER_UNIT, Ordering::Acquire, Ordering::Relaxed)
      .is_ok()
  }

  pub fn unlock_write(&self) -> Result<()> {
    self
      .state
      .fetch_update(Ordering::Release, Ordering::Relaxed, |state| {
        (state & WRITER_MASK != 0).then(|| state - WRITER_UNIT)
      })
      .map(|_| ())
      .map_err(|_| AllocError::WrongState("There are no write locks"))
  }

  pub fn is_locked_write(&self) -> bool {
    self.state.load(Ordering::Relaxed) & WRITER_MASK != 0
  }

  // === Configuration ===

  pub fn sleep_time(&self) -> u32 {
    self.sleep_ms.load(Ordering::Relaxed)
  }

  pub fn set_sleep_time(&self, sleep_ms: u32) {
    self.sleep_ms.store(sleep_ms, Ordering::Relaxed);
  }

  // === Guards ===

  #[inline]
  pub fn read(&self) -> ReadGuard<'_> {
    self.lock_read();
    ReadGuard { lock: self }
  }

  #[inline]
  pub fn write(&self) -> WriteGuard<'_> {
    self.lock_write();
    WriteGuard { lock: self }
  }
}

impl Default for RwSpinLock {
  fn default() -> Self {
    Self::new()
  }
}

/// Holds a shared lock until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReadGuard<'a> {
  lock: &'a RwSpinLock,
}

impl Drop for ReadGuard<'_> {
  fn drop(&mut self) {
    let released = self.lock.unlock_read();
    debug_assert!(released.is_ok(), "read guard without a read lock");
  }
}

/// Holds the exclusive lock until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
  lock: &'a RwSpinLock,
}

impl Drop for WriteGuard<'_> {
  fn drop(&mut self) {
    let released = self.lock.unlock_write();
    debug_assert!(released.is_ok(), "write guard without a write lock");
  }
}
