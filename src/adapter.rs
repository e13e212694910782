//! Typed helpers on top of [`Allocator`]: construct and destroy values in allocator
//! memory, owning boxes, and a [`GlobalAlloc`] bridge.

use core::{
  alloc::{GlobalAlloc, Layout},
  fmt,
  mem::size_of,
  ops::{Deref, DerefMut},
  ptr::{self, NonNull, null_mut},
};
use std::sync::Arc;

use crate::{
  align::Align,
  allocator::Allocator,
  error::{AllocError, Result},
};

/// Moves `value` into memory taken from `alloc`.
pub fn create_new<T, A: Allocator + ?Sized>(alloc: &A, value: T) -> Result<NonNull<T>> {
  let ptr = alloc
    .allocate_aligned(size_of::<T>(), Align::of::<T>())?
    .cast::<T>();
  unsafe { ptr.as_ptr().write(value) };
  Ok(ptr)
}

/// Drops the value at `ptr` and returns its memory to `alloc`.
///
/// # Safety
/// `ptr` must come from [`create_new`] on the same allocator and must not be used again.
pub unsafe fn delete<T, A: Allocator + ?Sized>(alloc: &A, ptr: NonNull<T>) -> Result<()> {
  if !alloc.is_memory_allocated_here(ptr.as_ptr() as *const u8) {
    return Err(AllocError::WrongArgument("Memory wasn't allocated here"));
  }
  unsafe {
    ptr::drop_in_place(ptr.as_ptr());
    alloc.deallocate(ptr.cast())
  }
}

/// Storage for `count` values of `T`, suitably aligned. The elements are not initialized.
pub fn allocate_array<T, A: Allocator + ?Sized>(alloc: &A, count: usize) -> Result<NonNull<T>> {
  let size = size_of::<T>()
    .checked_mul(count)
    .ok_or(AllocError::out_of_memory(usize::MAX, alloc.maximum_allocation_size()))?;
  Ok(alloc.allocate_aligned(size, Align::of::<T>())?.cast())
}

/// Owning pointer to a value living in an [`Allocator`]; drops the value and releases
/// the memory to the same allocator.
pub struct AllocBox<'a, T, A: Allocator + ?Sized> {
  ptr: NonNull<T>,
  alloc: &'a A,
}

unsafe impl<T: Send, A: Allocator + Sync + ?Sized> Send for AllocBox<'_, T, A> {}
unsafe impl<T: Sync, A: Allocator + Sync + ?Sized> Sync for AllocBox<'_, T, A> {}

impl<'a, T, A: Allocator + ?Sized> AllocBox<'a, T, A> {
  pub fn new_in(value: T, alloc: &'a A) -> Result<Self> {
    Ok(Self {
      ptr: create_new(alloc, value)?,
      alloc,
    })
  }

  pub fn as_ptr(&self) -> *const T {
    self.ptr.as_ptr()
  }

  pub fn allocator(&self) -> &'a A {
    self.alloc
  }
}

impl<T, A: Allocator + ?Sized> Deref for AllocBox<'_, T, A> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { self.ptr.as_ref() }
  }
}

impl<T, A: Allocator + ?Sized> DerefMut for AllocBox<'_, T, A> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { self.ptr.as_mut() }
  }
}

impl<T: fmt::Debug, A: Allocator + ?Sized> fmt::Debug for AllocBox<'_, T, A> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(&**self, f)
  }
}

impl<T, A: Allocator + ?Sized> Drop for AllocBox<'_, T, A> {
  fn drop(&mut self) {
    if let Err(err) = unsafe { delete(self.alloc, self.ptr) } {
      tracing::warn!(%err, "failed to release boxed value");
    }
  }
}

pub fn create_unique<T, A: Allocator + ?Sized>(alloc: &A, value: T) -> Result<AllocBox<'_, T, A>> {
  AllocBox::new_in(value, alloc)
}

/// Shared ownership; the value is released when the last [`Arc`] goes away.
pub fn create_shared<T, A: Allocator + ?Sized>(
  alloc: &A,
  value: T,
) -> Result<Arc<AllocBox<'_, T, A>>> {
  AllocBox::new_in(value, alloc).map(Arc::new)
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// Exposes an [`Allocator`] through [`GlobalAlloc`].
///
/// Failures become null pointers and foreign pointers passed to `dealloc` are ignored.
/// When installed as `#[global_allocator]` the wrapped allocator must not allocate
/// through the global allocator itself; the arena-only allocators (linear, stack, pool)
/// qualify, [`HeapAllocator`](crate::heap::HeapAllocator) does not.
pub struct GlobalAllocAdapter<A>(pub A);

impl<A: Allocator> GlobalAllocAdapter<A> {
  pub const fn new(alloc: A) -> Self {
    Self(alloc)
  }

  pub fn inner(&self) -> &A {
    &self.0
  }
}

unsafe impl<A: Allocator> GlobalAlloc for GlobalAllocAdapter<A> {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let Ok(align) = Align::new(layout.align()) else {
      return null_mut();
    };
    self
      .0
      .allocate_aligned(layout.size(), align)
      .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    if let Some(ptr) = NonNull::new(ptr) {
      if let Err(err) = unsafe { self.0.deallocate(ptr) } {
        tracing::trace!(%err, "foreign pointer ignored");
      }
    }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
      return unsafe {
        self.alloc(Layout::from_size_align_unchecked(
          new_size.max(1),
          layout.align(),
        ))
      };
    }

    if new_size == 0 {
      unsafe { self.dealloc(ptr, layout) };
      return null_mut();
    }

    let old_size = layout.size();
    if new_size <= old_size {
      return ptr;
    }

    let new_ptr =
      unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };

    if !new_ptr.is_null() {
      unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_size) };
      unsafe { self.dealloc(ptr, layout) };
    }

    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    heap::{HeapAllocator, HeapConfig},
    pool::PoolAllocator,
  };
  use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
  };

  struct Tracked<'a> {
    drops: &'a AtomicUsize,
    payload: [u64; 3],
  }

  impl Drop for Tracked<'_> {
    fn drop(&mut self) {
      self.drops.fetch_add(1, Ordering::Relaxed);
    }
  }

  fn heap() -> HeapAllocator {
    HeapAllocator::new(HeapConfig::default().with_heap_count(2)).unwrap()
  }

  #[test]
  fn test_create_and_delete() {
    let drops = AtomicUsize::new(0);
    let pool = PoolAllocator::<Tracked>::new(8, Align::ONE).unwrap();

    let ptr = create_new(
      &pool,
      Tracked {
        drops: &drops,
        payload: [1, 2, 3],
      },
    )
    .unwrap();
    assert_eq!(unsafe { ptr.as_ref() }.payload, [1, 2, 3]);
    assert_eq!(pool.used_elements_count(), 1);

    unsafe { delete(&pool, ptr).unwrap() };
    assert_eq!(drops.load(Ordering::Relaxed), 1);
    assert_eq!(pool.used_elements_count(), 0);
  }

  #[test]
  fn test_delete_foreign_pointer() {
    let heap = heap();
    let mut local = 5u32;
    let err = unsafe { delete(&heap, NonNull::from(&mut local)) }.unwrap_err();
    assert!(matches!(err, AllocError::WrongArgument(_)));
  }

  #[test]
  fn test_allocate_array() {
    let heap = heap();
    let array = allocate_array::<u64, _>(&heap, 100).unwrap();
    assert_eq!(array.as_ptr() as usize % align_of::<u64>(), 0);
    unsafe {
      for i in 0..100 {
        array.as_ptr().add(i).write(i as u64);
      }
      assert_eq!(array.as_ptr().add(99).read(), 99);
      heap.deallocate(array.cast()).unwrap();
    }
    assert!(allocate_array::<u64, _>(&heap, usize::MAX).is_err());
  }

  #[test]
  fn test_unique_box_releases_on_drop() {
    let drops = AtomicUsize::new(0);
    let heap = heap();
    {
      let mut boxed = create_unique(
        &heap,
        Tracked {
          drops: &drops,
          payload: [0; 3],
        },
      )
      .unwrap();
      boxed.payload[1] = 42;
      assert_eq!(boxed.payload, [0, 42, 0]);
      assert!(heap.used_memory_size() > 0);
    }
    assert_eq!(drops.load(Ordering::Relaxed), 1);
    assert_eq!(heap.used_memory_size(), 0);
  }

  #[test]
  fn test_shared_box_across_threads() {
    let heap = heap();
    let shared = create_shared(&heap, AtomicUsize::new(0)).unwrap();

    thread::scope(|s| {
      for _ in 0..4 {
        let shared = Arc::clone(&shared);
        s.spawn(move || {
          shared.fetch_add(1, Ordering::Relaxed);
        });
      }
    });

    assert_eq!(shared.load(Ordering::Relaxed), 4);
    drop(shared);
    assert_eq!(heap.used_memory_size(), 0);
  }

  #[test]
  fn test_global_alloc_round_trip() {
    let global = GlobalAllocAdapter::new(heap());
    let layout = Layout::from_size_align(64, 32).unwrap();

    unsafe {
      let ptr = global.alloc_zeroed(layout);
      assert!(!ptr.is_null());
      assert_eq!(ptr as usize % 32, 0);
      assert!(core::slice::from_raw_parts(ptr, 64).iter().all(|&b| b == 0));

      ptr::write_bytes(ptr, 0x5A, 64);
      let grown = global.realloc(ptr, layout, 4096);
      assert!(!grown.is_null());
      assert!(core::slice::from_raw_parts(grown, 64).iter().all(|&b| b == 0x5A));

      global.dealloc(grown, Layout::from_size_align(4096, 32).unwrap());
    }
    assert_eq!(global.inner().used_memory_size(), 0);
  }
}
