#![allow(clippy::missing_safety_doc)]

//! Arena-backed allocators for a real-time kernel.
//!
//! Every allocator draws its memory from [`Arena`]s mapped straight from the OS and
//! implements the common [`Allocator`] contract:
//!
//! - [`LinearAllocator`]: bump pointer, released all at once.
//! - [`StackAllocator`]: strict LIFO release.
//! - [`PoolAllocator`]: fixed-size slots for one type.
//! - [`HeapAllocator`]: general purpose, size classes over per-thread heaps.
//!
//! The [`adapter`] module builds typed construction, owning boxes and a
//! [`GlobalAlloc`](core::alloc::GlobalAlloc) bridge on top.

pub mod adapter;
pub mod align;
pub mod allocator;
pub mod arena;
pub mod error;
pub mod heap;
pub mod linear;
pub mod pool;
pub mod stack;
pub mod sync;
pub mod thread_key;

pub use align::Align;
pub use allocator::Allocator;
pub use arena::Arena;
pub use error::{AllocError, Result};
pub use heap::{HeapAllocator, HeapConfig, HeapSegment, SearchStrategy};
pub use linear::LinearAllocator;
pub use pool::PoolAllocator;
pub use stack::StackAllocator;
pub use thread_key::ThreadKey;
