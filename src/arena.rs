use core::{
  mem,
  ptr::{self, null_mut},
};

use crate::error::{AllocError, Result};

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

// =============================================================================
// Arena
// =============================================================================

/// Contiguous block of raw memory owned by exactly one allocator.
///
/// Mapped straight from the OS, so fresh memory reads as zero. The arena is move-only:
/// moving it out with [`mem::take`] leaves an empty arena behind.
#[derive(Debug)]
pub struct Arena {
  memory: *mut u8,
  size: usize,
}

// The arena is a plain owning handle; synchronization is the owner's job.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
  pub const fn empty() -> Self {
    Self {
      memory: null_mut(),
      size: 0,
    }
  }

  /// Maps `size` bytes. A zero size yields an empty arena.
  pub fn new(size: usize) -> Result<Self> {
    if size == 0 {
      return Ok(Self::empty());
    }

    let memory = unsafe { os_mmap(size) };
    if memory.is_null() {
      tracing::debug!(size, "arena mmap failed");
      return Err(AllocError::out_of_memory(size, 0));
    }

    tracing::trace!(size, ?memory, "arena mapped");
    Ok(Self { memory, size })
  }

  #[inline]
  pub fn memory_begin(&self) -> *mut u8 {
    self.memory
  }

  #[inline]
  pub fn memory_end(&self) -> *mut u8 {
    self.memory.wrapping_add(self.size)
  }

  #[inline]
  pub fn size(&self) -> usize {
    self.size
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.memory.is_null()
  }

  pub fn swap(&mut self, other: &mut Arena) {
    mem::swap(self, other);
  }

  /// Unmaps the memory. Safe to call more than once.
  pub fn destroy(&mut self) {
    if !self.memory.is_null() {
      tracing::trace!(size = self.size, memory = ?self.memory, "arena unmapped");
      unsafe { os_munmap(self.memory, self.size) };
      self.memory = null_mut();
      self.size = 0;
    }
  }

  #[inline]
  pub fn is_pointer_from_here(&self, ptr: *const u8) -> bool {
    let base = self.memory as usize;
    let addr = ptr as usize;
    !self.memory.is_null() && addr >= base && addr < base + self.size
  }

  /// Zeroes `len` bytes starting `offset` bytes into the arena.
  ///
  /// # Safety
  /// `offset + len` must not exceed the arena size.
  pub(crate) unsafe fn zero(&self, offset: usize, len: usize) {
    debug_assert!(offset + len <= self.size);
    unsafe { ptr::write_bytes(self.memory.add(offset), 0, len) };
  }
}

impl Default for Arena {
  fn default() -> Self {
    Self::empty()
  }
}

impl Drop for Arena {
  fn drop(&mut self) {
    self.destroy();
  }
}
