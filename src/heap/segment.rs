use core::{
  cell::UnsafeCell,
  mem::size_of,
  ptr::{self, NonNull},
  sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
  align::Align,
  allocator::Allocator,
  arena::Arena,
  error::{AllocError, Result},
  sync::RwSpinLock,
};

const CHUNK_USED: u16 = 0x5553;
const CHUNK_FREE: u16 = 0x4652;

/// Header placed right before every payload.
///
/// For a used chunk `link` is the owning segment (its arena base), `adjustment` is the
/// padding inserted before the header and `size_class` is the bin index. For a free
/// chunk, which keeps its header at the chunk start, `link` is the next free chunk of
/// the same class.
#[repr(C)]
#[derive(Clone, Copy)]
struct ChunkHeader {
  link: *mut u8,
  state: u16,
  adjustment: u16,
  size_class: u16,
}

pub const HEADER_SIZE: usize = size_of::<ChunkHeader>();

/// Largest alignment whose padding still fits the header's `adjustment` field.
pub(crate) const MAX_ALIGN: usize = u16::MAX as usize + 1;

const BIN_SIZE: usize = size_of::<*mut u8>();

/// Smallest `c` with `2^c >= size`.
#[inline]
fn class_for(size: usize) -> usize {
  if size <= 1 {
    0
  } else {
    (usize::BITS - (size - 1).leading_zeros()) as usize
  }
}

#[inline]
unsafe fn read_header(at: *const u8) -> ChunkHeader {
  unsafe { ptr::read_unaligned(at as *const ChunkHeader) }
}

#[inline]
unsafe fn write_header(at: *mut u8, header: ChunkHeader) {
  unsafe { ptr::write_unaligned(at as *mut ChunkHeader, header) }
}

struct SegmentState {
  /// Start of the memory no chunk has ever been carved from.
  top: *mut u8,
  free: usize,
}

/// Size-class allocator over one arena: the unit a [`HeapAllocator`](super::HeapAllocator)
/// grows by.
///
/// Arena layout: `|bins|chunk|chunk|...|unmanaged|`. A chunk of class `c` spans
/// `2^c + HEADER_SIZE` bytes. Freed chunks go to the bin of their class and are only
/// reused whole; a request may be served by a chunk of a larger class. When the last
/// live chunk is returned the segment is reset to its pristine state.
pub struct HeapSegment {
  lock: RwSpinLock,
  arena: Arena,
  size_class_count: usize,
  heap_owner: AtomicUsize,
  state: UnsafeCell<SegmentState>,
}

unsafe impl Send for HeapSegment {}
unsafe impl Sync for HeapSegment {}

impl HeapSegment {
  /// Segment managing at least `size` bytes, owned by heap `heap_owner`.
  pub fn new(size: usize, heap_owner: usize) -> Result<Self> {
    let size_class_count = class_for(size) + 1;
    let bins_size = size_class_count * BIN_SIZE;
    let arena_size = 1usize
      .checked_shl((size_class_count - 1) as u32)
      .and_then(|max_class_size| max_class_size.checked_add(HEADER_SIZE))
      .map(|largest_chunk| size.max(largest_chunk))
      .and_then(|managed| managed.checked_add(bins_size))
      .ok_or(AllocError::out_of_memory(size, 0))?;

    let arena = Arena::new(arena_size)?;
    let top = unsafe { arena.memory_begin().add(bins_size) };

    Ok(Self {
      lock: RwSpinLock::new(),
      size_class_count,
      heap_owner: AtomicUsize::new(heap_owner),
      state: UnsafeCell::new(SegmentState {
        top,
        free: arena_size - bins_size,
      }),
      arena,
    })
  }

  #[inline]
  fn bins(&self) -> *mut *mut u8 {
    self.arena.memory_begin() as *mut *mut u8
  }

  #[inline]
  fn bins_size(&self) -> usize {
    self.size_class_count * BIN_SIZE
  }

  #[inline]
  fn managed_begin(&self) -> *mut u8 {
    unsafe { self.arena.memory_begin().add(self.bins_size()) }
  }

  #[inline]
  unsafe fn bin(&self, class: usize) -> *mut u8 {
    unsafe { *self.bins().add(class) }
  }

  #[inline]
  unsafe fn set_bin(&self, class: usize, chunk: *mut u8) {
    unsafe { *self.bins().add(class) = chunk };
  }

  #[inline]
  pub fn size_of_class(&self, class: usize) -> usize {
    1usize << class
  }

  pub fn size_class_count(&self) -> usize {
    self.size_class_count
  }

  pub fn set_lock_sleep_time(&self, sleep_ms: u32) {
    self.lock.set_sleep_time(sleep_ms);
  }

  pub fn heap_owner(&self) -> usize {
    self.heap_owner.load(Ordering::Acquire)
  }

  pub fn set_heap_owner(&self, heap: usize) {
    self.heap_owner.store(heap, Ordering::Release);
  }

  /// Identity stored in used chunk headers.
  pub fn memory_begin(&self) -> *mut u8 {
    self.arena.memory_begin()
  }

  /// Managed bytes, that is everything except the bin array.
  pub fn committed_memory_size(&self) -> usize {
    self.arena.size() - self.bins_size()
  }

  pub fn unmanaged_memory_size(&self) -> usize {
    let _guard = self.lock.read();
    unsafe { self.unmanaged_unlocked() }
  }

  /// Caller must hold a lock.
  unsafe fn unmanaged_unlocked(&self) -> usize {
    self.arena.memory_end() as usize - unsafe { (*self.state.get()).top } as usize
  }

  /// Caller must hold a lock.
  unsafe fn maximum_allocation_size_unlocked(&self) -> usize {
    let unmanaged = unsafe { self.unmanaged_unlocked() };
    let from_top: usize = if unmanaged > HEADER_SIZE {
      1usize << (usize::BITS - 1 - (unmanaged - HEADER_SIZE).leading_zeros())
    } else {
      0
    };
    let from_bins = (0..self.size_class_count)
      .rev()
      .find(|&class| !unsafe { self.bin(class) }.is_null())
      .map_or(0, |class| self.size_of_class(class));

    from_top
      .max(from_bins)
      .min(self.size_of_class(self.size_class_count - 1))
  }

  /// Caller must hold the write lock.
  unsafe fn clear_unlocked(&self) {
    unsafe {
      self.arena.zero(0, self.bins_size());
      (*self.state.get()).top = self.managed_begin();
    }
  }
}

impl Allocator for HeapSegment {
  fn allocate_aligned(&self, size: usize, align: Align) -> Result<NonNull<u8>> {
    if align.value() > MAX_ALIGN {
      return Err(AllocError::WrongArgument("Alignment is too large"));
    }
    let request = size
      .max(1)
      .checked_add(align.value() - 1)
      .ok_or(AllocError::out_of_memory(usize::MAX, 0))?;

    let _guard = self.lock.write();

    let available = unsafe { self.maximum_allocation_size_unlocked() };
    if request > available {
      return Err(AllocError::out_of_memory(request, available));
    }

    let mut class = class_for(request);
    let mut chunk_size = self.size_of_class(class) + HEADER_SIZE;
    let unmanaged = unsafe { self.unmanaged_unlocked() };
    let state = unsafe { &mut *self.state.get() };

    let mem = if unsafe { self.bin(class) }.is_null() && unmanaged >= chunk_size {
      let mem = state.top;
      state.top = unsafe { mem.add(chunk_size) };
      mem
    } else {
      class = (class..self.size_class_count)
        .find(|&class| !unsafe { self.bin(class) }.is_null())
        .ok_or(AllocError::out_of_memory(request, available))?;
      chunk_size = self.size_of_class(class) + HEADER_SIZE;

      let mem = unsafe { self.bin(class) };
      unsafe { self.set_bin(class, read_header(mem).link) };
      mem
    };

    let adjustment = align.compute_adjustment(unsafe { mem.add(HEADER_SIZE) });
    unsafe {
      write_header(
        mem.add(adjustment),
        ChunkHeader {
          link: self.memory_begin(),
          state: CHUNK_USED,
          adjustment: adjustment as u16,
          size_class: class as u16,
        },
      );
    }
    state.free -= chunk_size;

    Ok(unsafe { NonNull::new_unchecked(mem.add(adjustment + HEADER_SIZE)) })
  }

  unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
    let addr = ptr.as_ptr() as usize;
    let managed_begin = self.managed_begin() as usize;
    if addr < managed_begin + HEADER_SIZE || addr >= self.arena.memory_end() as usize {
      return Err(AllocError::WrongArgument("Memory wasn't allocated here"));
    }

    let _guard = self.lock.write();

    let header_at = unsafe { ptr.as_ptr().sub(HEADER_SIZE) };
    let mut header = unsafe { read_header(header_at) };
    if header.state == CHUNK_FREE {
      return Err(AllocError::WrongState("Memory was already released"));
    }
    let class = header.size_class as usize;
    let adjustment = header.adjustment as usize;
    if header.state != CHUNK_USED
      || header.link != self.memory_begin()
      || class >= self.size_class_count
      || (header_at as usize) - managed_begin < adjustment
    {
      return Err(AllocError::WrongArgument("Memory wasn't allocated here"));
    }

    let mem = unsafe { header_at.sub(adjustment) };
    unsafe {
      header.state = CHUNK_FREE;
      write_header(header_at, header);
      write_header(
        mem,
        ChunkHeader {
          link: self.bin(class),
          state: CHUNK_FREE,
          adjustment: 0,
          size_class: class as u16,
        },
      );
      self.set_bin(class, mem);
    }
    let state = unsafe { &mut *self.state.get() };
    state.free += self.size_of_class(class) + HEADER_SIZE;

    if state.free == self.committed_memory_size() {
      unsafe { self.clear_unlocked() };
    }
    Ok(())
  }

  fn maximum_allocation_size(&self) -> usize {
    let _guard = self.lock.read();
    unsafe { self.maximum_allocation_size_unlocked() }
  }

  fn used_memory_size(&self) -> usize {
    let _guard = self.lock.read();
    self.committed_memory_size() - unsafe { (*self.state.get()).free }
  }

  fn free_memory_size(&self) -> usize {
    let _guard = self.lock.read();
    unsafe { (*self.state.get()).free }
  }

  fn is_memory_allocated_here(&self, ptr: *const u8) -> bool {
    self.arena.is_pointer_from_here(ptr)
  }
}
