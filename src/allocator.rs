use core::ptr::NonNull;

use crate::{align::Align, error::Result};

/// Raw byte allocation contract shared by every allocator in the crate.
///
/// The trait is object safe, so kernel code can hold a `&dyn Allocator` without caring
/// which strategy sits behind it.
pub trait Allocator {
  fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
    self.allocate_aligned(size, Align::ONE)
  }

  fn allocate_aligned(&self, size: usize, align: Align) -> Result<NonNull<u8>>;

  /// Returns a block to the allocator.
  ///
  /// # Safety
  /// `ptr` must come from this allocator and must not have been deallocated already.
  /// Violations that can be detected cheaply are reported as errors, but not all can.
  unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<()>;

  /// Largest single request that can currently succeed.
  fn maximum_allocation_size(&self) -> usize;

  fn used_memory_size(&self) -> usize;

  fn free_memory_size(&self) -> usize;

  fn is_memory_allocated_here(&self, ptr: *const u8) -> bool;
}

impl<A: Allocator + ?Sized> Allocator for &A {
  fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
    (**self).allocate(size)
  }

  fn allocate_aligned(&self, size: usize, align: Align) -> Result<NonNull<u8>> {
    (**self).allocate_aligned(size, align)
  }

  unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
    unsafe { (**self).deallocate(ptr) }
  }

  fn maximum_allocation_size(&self) -> usize {
    (**self).maximum_allocation_size()
  }

  fn used_memory_size(&self) -> usize {
    (**self).used_memory_size()
  }

  fn free_memory_size(&self) -> usize {
    (**self).free_memory_size()
  }

  fn is_memory_allocated_here(&self, ptr: *const u8) -> bool {
    (**self).is_memory_allocated_here(ptr)
  }
}
