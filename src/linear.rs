use core::{
  cell::UnsafeCell,
  ptr::{self, NonNull},
};

use crate::{
  align::Align,
  allocator::Allocator,
  arena::Arena,
  error::{AllocError, Result},
  sync::RwSpinLock,
};

/// Bump-pointer allocator over a single arena.
///
/// Blocks are zero-filled on allocation. Individual deallocation does nothing; the whole
/// arena is recycled at once with [`clear`](Self::clear), which does not wipe memory.
pub struct LinearAllocator {
  lock: RwSpinLock,
  arena: Arena,
  top: UnsafeCell<*mut u8>,
}

unsafe impl Send for LinearAllocator {}
unsafe impl Sync for LinearAllocator {}

impl LinearAllocator {
  pub fn new(size: usize) -> Result<Self> {
    Ok(Self::from_arena(Arena::new(size)?))
  }

  /// Takes ownership of an existing arena.
  pub fn from_arena(arena: Arena) -> Self {
    let top = arena.memory_begin();
    Self {
      lock: RwSpinLock::new(),
      arena,
      top: UnsafeCell::new(top),
    }
  }

  /// Makes the whole arena available again.
  pub fn clear(&self) {
    let _guard = self.lock.write();
    unsafe { *self.top.get() = self.arena.memory_begin() };
  }

  /// Caller must hold the lock.
  #[inline]
  unsafe fn used_unlocked(&self) -> usize {
    unsafe { *self.top.get() as usize - self.arena.memory_begin() as usize }
  }
}

impl Allocator for LinearAllocator {
  fn allocate_aligned(&self, size: usize, align: Align) -> Result<NonNull<u8>> {
    let _guard = self.lock.write();
    if self.arena.is_empty() {
      return Err(AllocError::out_of_memory(size, 0));
    }

    let top = unsafe { *self.top.get() };
    let adjustment = align.compute_adjustment(top);
    let free = self.arena.size() - unsafe { self.used_unlocked() };
    let total = size
      .checked_add(adjustment)
      .ok_or(AllocError::out_of_memory(usize::MAX, free))?;
    if total > free {
      return Err(AllocError::out_of_memory(total, free));
    }

    let mem = unsafe { top.add(adjustment) };
    unsafe {
      ptr::write_bytes(mem, 0, size);
      *self.top.get() = top.add(total);
    }
    Ok(unsafe { NonNull::new_unchecked(mem) })
  }

  /// No-op: memory is only reclaimed by [`LinearAllocator::clear`].
  unsafe fn deallocate(&self, _ptr: NonNull<u8>) -> Result<()> {
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
