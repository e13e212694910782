use std::thread;

/// How a heap picks a segment for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SearchStrategy {
  /// First segment whose largest possible allocation is big enough.
  FirstFit = 0,
  /// Segment with the smallest sufficient largest possible allocation.
  #[default]
  BestFit = 1,
}

impl SearchStrategy {
  pub(crate) const fn from_u8(value: u8) -> Self {
    match value {
      0 => Self::FirstFit,
      _ => Self::BestFit,
    }
  }
}

/// Construction parameters for [`HeapAllocator`](super::HeapAllocator).
///
/// ```
/// use segheap::heap::{HeapConfig, SearchStrategy};
///
/// let config = HeapConfig::default()
///   .with_page_size_kb(64)
///   .with_heap_count(4)
///   .with_strategy(SearchStrategy::FirstFit);
/// assert_eq!(config.page_size(), 64 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct HeapConfig {
  pub page_size_kb: usize,
  /// Number of thread-affinity heaps, not counting the shared heap.
  pub heap_count: usize,
  /// A segment whose used/free ratio drops below this moves to the shared heap.
  pub free_fraction: f32,
  pub strategy: SearchStrategy,
  pub lock_sleep_ms: u32,
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      page_size_kb: 16,
      heap_count: thread::available_parallelism().map_or(1, |n| n.get()),
      free_fraction: 0.1,
      strategy: SearchStrategy::BestFit,
      lock_sleep_ms: 0,
    }
  }
}

impl HeapConfig {
  pub fn with_page_size_kb(mut self, page_size_kb: usize) -> Self {
    self.page_size_kb = page_size_kb;
    self
  }

  pub fn with_heap_count(mut self, heap_count: usize) -> Self {
    self.heap_count = heap_count;
    self
  }

  pub fn with_free_fraction(mut self, free_fraction: f32) -> Self {
    self.free_fraction = free_fraction;
    self
  }

  pub fn with_strategy(mut self, strategy: SearchStrategy) -> Self {
    self.strategy = strategy;
    self
  }

  pub fn with_lock_sleep_ms(mut self, lock_sleep_ms: u32) -> Self {
    self.lock_sleep_ms = lock_sleep_ms;
    self
  }

  /// Growth granularity in bytes.
  pub fn page_size(&self) -> usize {
    self.page_size_kb.max(1) * 1024
  }
}
