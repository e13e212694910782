//! General-purpose heap: thread-affinity heaps of size-class segments.

mod allocator;
mod config;
mod segment;

pub use allocator::{HeapAllocator, SHARED_HEAP};
pub use config::{HeapConfig, SearchStrategy};
pub use segment::{HEADER_SIZE, HeapSegment};
