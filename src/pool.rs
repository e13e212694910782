use core::{
  cell::UnsafeCell,
  marker::PhantomData,
  mem::{self, size_of},
  ptr::{self, NonNull, null_mut},
};

use crate::{
  align::Align,
  allocator::Allocator,
  arena::Arena,
  error::{AllocError, Result},
  sync::RwSpinLock,
};

/// Every pool arena starts with the handle of the previously added arena.
const CHAIN_HEADER_SIZE: usize = size_of::<Arena>();
const LINK_SIZE: usize = size_of::<*mut u8>();

// Arena memory is page aligned, so the chain header can be written in place.
const _: () = assert!(core::mem::align_of::<Arena>() <= 4096);

struct PoolState {
  /// Newest arena; the older ones hang off its chain header.
  head: Arena,
  first_free: *mut u8,
  arena_count: usize,
  total_count: usize,
  free_count: usize,
}

/// Fixed-size slot allocator for values of type `T`.
///
/// Arena layout: `|previous arena|padding|slot|padding|slot|...`. A free slot stores the
/// address of the next free slot in its first bytes. When the free list runs dry the
/// pool grows by one more arena of the same size.
///
/// The pool only reserves and zeroes storage. Constructing and dropping `T` is up to the
/// caller (see [`crate::adapter`]).
pub struct PoolAllocator<T> {
  lock: RwSpinLock,
  state: UnsafeCell<PoolState>,
  align: Align,
  chunk_size: usize,
  arena_size: usize,
  _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for PoolAllocator<T> {}
unsafe impl<T: Send> Sync for PoolAllocator<T> {}

impl<T> PoolAllocator<T> {
  /// Room for at least `count` elements per arena. The effective alignment is the
  /// stricter of `align` and the natural alignment of `T`.
  pub fn new(count: usize, align: Align) -> Result<Self> {
    let align = align.max(Align::of::<T>());
    let chunk_size = size_of::<T>().max(LINK_SIZE);
    let arena_size = count
      .max(1)
      .checked_mul(chunk_size + align.value() - 1)
      .and_then(|bytes| bytes.checked_add(CHAIN_HEADER_SIZE))
      .ok_or(AllocError::out_of_memory(usize::MAX, 0))?;

    let pool = Self {
      lock: RwSpinLock::new(),
      state: UnsafeCell::new(PoolState {
        head: Arena::empty(),
        first_free: null_mut(),
        arena_count: 0,
        total_count: 0,
        free_count: 0,
      }),
      align,
      chunk_size,
      arena_size,
      _marker: PhantomData,
    };
    unsafe { pool.grow(&mut *pool.state.get())? };
    Ok(pool)
  }

  /// Threads a fresh arena into the chain and merges its slots into the free list.
  /// Caller must hold the write lock.
  unsafe fn grow(&self, state: &mut PoolState) -> Result<()> {
    let arena = Arena::new(self.arena_size)?;
    unsafe {
      ptr::write(
        arena.memory_begin() as *mut Arena,
        mem::take(&mut state.head),
      );
    }

    let (first, count) = unsafe { self.carve(&arena, state.first_free) };
    state.first_free = first;
    state.head = arena;
    state.arena_count += 1;
    state.total_count += count;
    state.free_count += count;

    tracing::debug!(
      arena_count = state.arena_count,
      total = state.total_count,
      "pool grew by one arena"
    );
    Ok(())
  }

  /// Splits `arena` into aligned slots linked in address order, ending with `tail`.
  unsafe fn carve(&self, arena: &Arena, tail: *mut u8) -> (*mut u8, usize) {
    let end = arena.memory_end() as usize;
    let mut mem = unsafe { arena.memory_begin().add(CHAIN_HEADER_SIZE) };
    let mut first = tail;
    let mut link: *mut *mut u8 = &raw mut first;
    let mut count = 0;

    loop {
      let adjustment = self.align.compute_adjustment(mem);
      if mem as usize + adjustment + self.chunk_size > end {
        break;
      }
      unsafe {
        let slot = mem.add(adjustment);
        ptr::write_unaligned(link, slot);
        link = slot as *mut *mut u8;
        mem = slot.add(self.chunk_size);
      }
      count += 1;
    }
    unsafe { ptr::write_unaligned(link, tail) };

    (first, count)
  }

  /// Caller must hold a lock.
  unsafe fn contains_unlocked(&self, ptr: *const u8) -> bool {
    let mut arena = unsafe { &(*self.state.get()).head };
    while !arena.is_empty() {
      if arena.is_pointer_from_here(ptr) {
        return ptr as usize >= arena.memory_begin() as usize + CHAIN_HEADER_SIZE;
      }
      arena = unsafe { &*(arena.memory_begin() as *const Arena) };
    }
    false
  }

  /// Hands out one zeroed slot, growing the pool when it is exhausted.
  pub fn allocate_element(&self) -> Result<NonNull<T>> {
    let _guard = self.lock.write();
    let state = unsafe { &mut *self.state.get() };

    if state.free_count == 0 {
      unsafe { self.grow(state)? };
    }

    let slot = state.first_free;
    debug_assert!(!slot.is_null());
    unsafe {
      state.first_free = ptr::read_unaligned(slot as *const *mut u8);
      ptr::write_bytes(slot, 0, size_of::<T>());
    }
    state.free_count -= 1;

    Ok(unsafe { NonNull::new_unchecked(slot as *mut T) })
  }

  /// Puts a slot back on the free list. `T` is not dropped.
  ///
  /// # Safety
  /// `ptr` must come from [`allocate_element`](Self::allocate_element) on this pool and
  /// must not be released twice.
  pub unsafe fn deallocate_element(&self, ptr: NonNull<T>) -> Result<()> {
    let _guard = self.lock.write();
    let slot = ptr.as_ptr() as *mut u8;
    if !unsafe { self.contains_unlocked(slot) } {
      return Err(AllocError::WrongArgument("Memory wasn't allocated here"));
    }

    let state = unsafe { &mut *self.state.get() };
    unsafe { ptr::write_unaligned(slot as *mut *mut u8, state.first_free) };
    state.first_free = slot;
    state.free_count += 1;
    Ok(())
  }

  pub fn total_elements_count(&self) -> usize {
    let _guard = self.lock.read();
    unsafe { (*self.state.get()).total_count }
  }

  pub fn free_elements_count(&self) -> usize {
    let _guard = self.lock.read();
    unsafe { (*self.state.get()).free_count }
  }

  pub fn used_elements_count(&self) -> usize {
    let _guard = self.lock.read();
    let state = unsafe { &*self.state.get() };
    state.total_count - state.free_count
  }

  pub fn arena_count(&self) -> usize {
    let _guard = self.lock.read();
    unsafe { (*self.state.get()).arena_count }
  }

  pub fn alignment(&self) -> Align {
    self.align
  }

  pub fn total_memory_size(&self) -> usize {
    let _guard = self.lock.read();
    self.arena_size * unsafe { (*self.state.get()).arena_count }
  }

  /// Bytes spent on chain headers, padding and slot rounding.
  pub fn extra_memory_size(&self) -> usize {
    let _guard = self.lock.read();
    let state = unsafe { &*self.state.get() };
    self.arena_size * state.arena_count - state.total_count * size_of::<T>()
  }
}

impl<T> Allocator for PoolAllocator<T> {
  /// `size` only has to fit in one slot; every request gets a whole slot.
  fn allocate_aligned(&self, size: usize, align: Align) -> Result<NonNull<u8>> {
    if size > self.chunk_size {
      return Err(AllocError::out_of_memory(size, self.chunk_size));
    }
    if align.value() > self.align.value() {
      return Err(AllocError::WrongArgument(
        "Alignment is stricter than the pool alignment",
      ));
    }
    self.allocate_element().map(NonNull::cast)
  }

  unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
    unsafe { self.deallocate_element(ptr.cast()) }
  }

  fn maximum_allocation_size(&self) -> usize {
    self.chunk_size
  }

  fn used_memory_size(&self) -> usize {
    let _guard = self.lock.read();
    let state = unsafe { &*self.state.get() };
    self.arena_size * state.arena_count - state.free_count * size_of::<T>()
  }

  fn free_memory_size(&self) -> usize {
    let _guard = self.lock.read();
    unsafe { (*self.state.get()).free_count * size_of::<T>() }
  }

  fn is_memory_allocated_here(&self, ptr: *const u8) -> bool {
    let _guard = self.lock.read();
    unsafe { self.contains_unlocked(ptr) }
  }
}

impl<T> Drop for PoolAllocator<T> {
  fn drop(&mut self) {
    let state = self.state.get_mut();
    let mut arena = mem::take(&mut state.head);
    while !arena.is_empty() {
      let prev = unsafe { ptr::read(arena.memory_begin() as *const Arena) };
      drop(arena);
      arena = prev;
    }
    state.first_free = null_mut();
  }
}
