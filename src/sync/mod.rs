//! Busy-wait locks for short critical sections on allocation hot paths.
//!
//! Both locks spin with [`hint::spin_loop`] and, when configured with a non-zero sleep
//! time, put the waiting thread to sleep between attempts instead.

use core::hint;
use std::{thread, time::Duration};

mod locked;
mod rw_spinlock;
mod spinlock;

pub use locked::Locked;
pub use rw_spinlock::{ReadGuard, RwSpinLock, WriteGuard};
pub use spinlock::{SpinLock, SpinLockGuard};

/// One waiting step: spin when `sleep_ms` is zero, sleep otherwise.
#[inline]
pub(crate) fn backoff(sleep_ms: u32) {
  if sleep_ms == 0 {
    hint::spin_loop();
  } else {
    thread::sleep(Duration::from_millis(u64::from(sleep_ms)));
  }
}
