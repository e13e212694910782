use core::{
  cell::UnsafeCell,
  mem::size_of,
  ptr::{self, NonNull},
};

use crate::{
  align::Align,
  allocator::Allocator,
  arena::Arena,
  error::{AllocError, Result},
  sync::RwSpinLock,
};

/// Bookkeeping stored right before every payload: `|padding|AllocationInfo|payload|`.
#[repr(C)]
#[derive(Clone, Copy)]
struct AllocationInfo {
  /// Previous live allocation, restored as "last" when this one is released.
  #[cfg(feature = "lifo-check")]
  prev_alloc: *mut u8,
  /// Bytes of padding in front of this header.
  adjustment: usize,
}

const INFO_SIZE: usize = size_of::<AllocationInfo>();

struct StackState {
  top: *mut u8,
  #[cfg(feature = "lifo-check")]
  last: *mut u8,
}

/// LIFO allocator over a single arena.
///
/// Blocks must be released in exact reverse order of allocation. With the `lifo-check`
/// feature (on by default) an out-of-order release is rejected with
/// [`AllocError::WrongState`]; without it the check costs nothing and the order is purely
/// the caller's responsibility.
///
/// The lock only protects the cursor. One stack is meant to be driven by one writer at a
/// time: interleaving threads cannot keep a meaningful release order.
pub struct StackAllocator {
  lock: RwSpinLock,
  arena: Arena,
  state: UnsafeCell<StackState>,
}

unsafe impl Send for StackAllocator {}
unsafe impl Sync for StackAllocator {}

impl StackAllocator {
  pub fn new(size: usize) -> Result<Self> {
    Ok(Self::from_arena(Arena::new(size)?))
  }

  pub fn from_arena(arena: Arena) -> Self {
    let top = arena.memory_begin();
    Self {
      lock: RwSpinLock::new(),
      arena,
      state: UnsafeCell::new(StackState {
        top,
        #[cfg(feature = "lifo-check")]
        last: ptr::null_mut(),
      }),
    }
  }

  /// Releases every allocation at once.
  pub fn clear(&self) {
    let _guard = self.lock.write();
    let state = unsafe { &mut *self.state.get() };
    state.top = self.arena.memory_begin();
    #[cfg(feature = "lifo-check")]
    {
      state.last = ptr::null_mut();
    }
  }

  /// Caller must hold the lock.
  #[inline]
  unsafe fn used_unlocked(&self) -> usize {
    unsafe { (*self.state.get()).top as usize - self.arena.memory_begin() as usize }
  }
}

impl Allocator for StackAllocator {
  fn allocate_aligned(&self, size: usize, align: Align) -> Result<NonNull<u8>> {
    let _guard = self.lock.write();
    if self.arena.is_empty() {
      return Err(AllocError::out_of_memory(size, 0));
    }

    let free = self.arena.size() - unsafe { self.used_unlocked() };
    let state = unsafe { &mut *self.state.get() };
    let adjustment = align.compute_adjustment(state.top.wrapping_add(INFO_SIZE));
    let total = size
      .checked_add(adjustment + INFO_SIZE)
      .ok_or(AllocError::out_of_memory(usize::MAX, free))?;
    if total > free {
      return Err(AllocError::out_of_memory(total, free));
    }

    unsafe {
      let info = state.top.add(adjustment) as *mut AllocationInfo;
      let mem = state.top.add(adjustment + INFO_SIZE);
      ptr::write_unaligned(
        info,
        AllocationInfo {
          #[cfg(feature = "lifo-check")]
          prev_alloc: state.last,
          adjustment,
        },
      );
      ptr::write_bytes(mem, 0, size);

      #[cfg(feature = "lifo-check")]
      {
        state.last = mem;
      }
      state.top = state.top.add(total);
      Ok(NonNull::new_unchecked(mem))
    }
  }

  unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
    let _guard = self.lock.write();
    let state = unsafe { &mut *self.state.get() };
    let addr = ptr.as_ptr() as usize;

    let lowest = self.arena.memory_begin() as usize + INFO_SIZE;
    if self.arena.is_empty() || addr < lowest || addr > state.top as usize {
      return Err(AllocError::WrongArgument(
        "Memory wasn't allocated by this stack",
      ));
    }

    #[cfg(feature = "lifo-check")]
    if ptr.as_ptr() != state.last {
      return Err(AllocError::WrongState(
        "Stack memory must be released in reverse order of allocation",
      ));
    }

    unsafe {
      let info = ptr::read_unaligned(ptr.as_ptr().sub(INFO_SIZE) as *const AllocationInfo);
      state.top = ptr.as_ptr().sub(INFO_SIZE + info.adjustment);
      #[cfg(feature = "lifo-check")]
      {
        state.last = info.prev_alloc;
      }
    }
    Ok(())
  }

  fn maximum_allocation_size(&self) -> usize {
    self.free_memory_size()
  }

  fn used_memory_size(&self) -> usize {
    let _guard = self.lock.read();
    unsafe { self.used_unlocked() }
  }

  fn free_memory_size(&self) -> usize {
    let _guard = self.lock.read();
    self.arena.size() - unsafe { self.used_unlocked() }
  }

  fn is_memory_allocated_here(&self, ptr: *const u8) -> bool {
    self.arena.is_pointer_from_here(ptr)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_lifo_round_trip() {
    let allocator = StackAllocator::new(4096).unwrap();
    let mut free = [0usize; 5];

    free[0] = allocator.free_memory_size();
    let first = allocator.allocate_aligned(100, Align::new(4).unwrap()).unwrap();
    free[1] = allocator.free_memory_size();
    let second = allocator.allocate(10 * 24).unwrap();
    free[2] = allocator.free_memory_size();
    let third = allocator.allocate(1000).unwrap();
    free[3] = allocator.free_memory_size();
    let fourth = allocator.allocate_aligned(2000, Align::new(16).unwrap()).unwrap();
    free[4] = allocator.free_memory_size();

    assert_eq!(fourth.as_ptr() as usize % 16, 0);
    assert!(free.windows(2).all(|w| w[0] > w[1]));

    unsafe {
      allocator.deallocate(fourth).unwrap();
      assert_eq!(allocator.free_memory_size(), free[3]);
      allocator.deallocate(third).unwrap();
      assert_eq!(allocator.free_memory_size(), free[2]);
      allocator.deallocate(second).unwrap();
      assert_eq!(allocator.free_memory_size(), free[1]);
      allocator.deallocate(first).unwrap();
      assert_eq!(allocator.free_memory_size(), free[0]);
    }
    assert_eq!(allocator.used_memory_size(), 0);
  }

  #[cfg(feature = "lifo-check")]
  #[test]
  fn test_out_of_order_release_is_rejected() {
    let allocator = StackAllocator::new(1024).unwrap();
    let a = allocator.allocate(16).unwrap();
    let b = allocator.allocate(16).unwrap();
    let c = allocator.allocate(16).unwrap();
    let used = allocator.used_memory_size();

    let err = unsafe { allocator.deallocate(b) }.unwrap_err();
    assert!(matches!(err, AllocError::WrongState(_)));
    assert_eq!(allocator.used_memory_size(), used);

    unsafe {
      allocator.deallocate(c).unwrap();
      allocator.deallocate(b).unwrap();
      allocator.deallocate(a).unwrap();
    }
    assert_eq!(allocator.used_memory_size(), 0);
  }

  #[test]
  fn test_foreign_pointer_is_rejected() {
    let allocator = StackAllocator::new(1024).unwrap();
    allocator.allocate(16).unwrap();

    let mut local = 0u8;
    let err = unsafe { allocator.deallocate(NonNull::from(&mut local)) }.unwrap_err();
    assert!(matches!(err, AllocError::WrongArgument(_)));
  }

  #[test]
  fn test_out_of_memory_and_clear() {
    let allocator = StackAllocator::new(256).unwrap();
    allocator.allocate(128).unwrap();

    let err = allocator.allocate(256).unwrap_err();
    assert!(err.is_out_of_memory());

    allocator.clear();
    assert_eq!(allocator.used_memory_size(), 0);
    let block = allocator.allocate(256 - INFO_SIZE).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(block.as_ptr(), 256 - INFO_SIZE) };
    assert!(bytes.iter().all(|&b| b == 0));
    assert_eq!(allocator.free_memory_size(), 0);
  }
}
