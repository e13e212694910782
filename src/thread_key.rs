use core::sync::atomic::{AtomicU64, Ordering};

/// Opaque caller identity used to route heap allocations.
///
/// [`ThreadKey::current`] hands every thread its own key on first use. Callers that
/// schedule work themselves can pass an explicit key to
/// [`HeapAllocator::allocate_for`](crate::heap::HeapAllocator::allocate_for) instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadKey(u64);

impl ThreadKey {
  pub const fn new(value: u64) -> Self {
    Self(value)
  }

  pub fn current() -> Self {
    thread_local! {
      static KEY: u64 = {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        // Only uniqueness matters.
        NEXT.fetch_add(1, Ordering::Relaxed)
      };
    }
    Self(KEY.with(|&key| key))
  }

  pub const fn value(self) -> u64 {
    self.0
  }
}
