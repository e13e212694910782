use core::{
  ptr::NonNull,
  sync::atomic::{AtomicU8, Ordering},
};

use crossbeam_utils::CachePadded;

use super::{
  config::{HeapConfig, SearchStrategy},
  segment::{HeapSegment, MAX_ALIGN},
};
use crate::{
  adapter,
  align::Align,
  allocator::Allocator,
  error::{AllocError, Result},
  pool::PoolAllocator,
  sync::{Locked, SpinLock},
  thread_key::ThreadKey,
};

/// Index of the heap that collects mostly-free segments for reuse by any thread.
pub const SHARED_HEAP: usize = 0;

const SEGMENTS_PER_POOL_ARENA: usize = 64;

/// Handle to a segment living in the allocator's segment pool.
///
/// Segments are only released when the allocator is dropped, so a handle stays valid
/// for the allocator's whole lifetime even after its segment changes heaps.
#[derive(Clone, Copy, PartialEq, Eq)]
struct SegmentRef(NonNull<HeapSegment>);

unsafe impl Send for SegmentRef {}
unsafe impl Sync for SegmentRef {}

impl SegmentRef {
  #[inline]
  fn get(&self) -> &HeapSegment {
    unsafe { self.0.as_ref() }
  }

  #[inline]
  fn begin(&self) -> usize {
    self.get().memory_begin() as usize
  }
}

struct Heap {
  /// Newest segment first.
  segments: Locked<Vec<SegmentRef>>,
  /// Serializes growth of this heap so concurrent misses create one segment, not many.
  growth: SpinLock,
}

/// General-purpose allocator built from [`HeapSegment`]s.
///
/// Heap 0 is the shared heap; heaps `1..=heap_count` are thread-affinity heaps. A caller
/// is routed to one affinity heap by its [`ThreadKey`], searches it for a segment that
/// can serve the request and, on a miss, takes a segment from the shared heap or maps a
/// fresh one. A segment that becomes mostly free on deallocation is handed back to the
/// shared heap.
pub struct HeapAllocator {
  heaps: Box<[CachePadded<Heap>]>,
  /// Every segment ever created, sorted by arena address.
  registry: Locked<Vec<SegmentRef>>,
  segment_pool: PoolAllocator<HeapSegment>,
  page_size: usize,
  free_fraction: f32,
  lock_sleep_ms: u32,
  strategy: AtomicU8,
}

impl HeapAllocator {
  pub fn new(config: HeapConfig) -> Result<Self> {
    let heap_count = config.heap_count.max(1);
    let heaps = (0..=heap_count)
      .map(|_| {
        let heap = Heap {
          segments: Locked::new(Vec::new()),
          growth: SpinLock::new(),
        };
        heap.segments.set_sleep_time(config.lock_sleep_ms);
        heap.growth.set_sleep_time(config.lock_sleep_ms);
        CachePadded::new(heap)
      })
      .collect();

    let registry = Locked::new(Vec::new());
    registry.set_sleep_time(config.lock_sleep_ms);

    tracing::debug!(
      heap_count,
      page_size = config.page_size(),
      strategy = ?config.strategy,
      "heap allocator created"
    );

    Ok(Self {
      heaps,
      registry,
      segment_pool: PoolAllocator::new(SEGMENTS_PER_POOL_ARENA, Align::of::<HeapSegment>())?,
      page_size: config.page_size(),
      free_fraction: config.free_fraction,
      lock_sleep_ms: config.lock_sleep_ms,
      strategy: AtomicU8::new(config.strategy as u8),
    })
  }

  /// Number of thread-affinity heaps.
  pub fn heap_count(&self) -> usize {
    self.heaps.len() - 1
  }

  /// Affinity heap serving `key`; never [`SHARED_HEAP`].
  pub fn heap_index_for(&self, key: ThreadKey) -> usize {
    1 + (key.value() % self.heap_count() as u64) as usize
  }

  pub fn page_size(&self) -> usize {
    self.page_size
  }

  pub fn strategy(&self) -> SearchStrategy {
    SearchStrategy::from_u8(self.strategy.load(Ordering::Relaxed))
  }

  pub fn set_strategy(&self, strategy: SearchStrategy) {
    self.strategy.store(strategy as u8, Ordering::Relaxed);
  }

  /// Segments currently listed in `heap`; zero for an unknown index.
  pub fn segment_count(&self, heap: usize) -> usize {
    self
      .heaps
      .get(heap)
      .map_or(0, |heap| heap.segments.read(Vec::len))
  }

  /// Heap that currently owns the segment containing `ptr`.
  pub fn heap_of(&self, ptr: *const u8) -> Option<usize> {
    self.lookup(ptr).map(|seg| seg.get().heap_owner())
  }

  /// Allocates on behalf of an explicit caller identity.
  pub fn allocate_for(&self, key: ThreadKey, size: usize, align: Align) -> Result<NonNull<u8>> {
    if align.value() > MAX_ALIGN {
      return Err(AllocError::WrongArgument("Alignment is too large"));
    }
    let request = size
      .max(1)
      .checked_add(align.value() - 1)
      .ok_or(AllocError::out_of_memory(usize::MAX, 0))?;

    let index = self.heap_index_for(key);
    if let Some(block) = self.allocate_from_heap(index, request, size, align)? {
      return Ok(block);
    }

    let heap = &self.heaps[index];
    let _growth = heap.growth.lock();

    if let Some(block) = self.allocate_from_heap(index, request, size, align)? {
      return Ok(block);
    }

    if let Some(seg) = self.requisition(index, request) {
      match seg.get().allocate_aligned(size, align) {
        Ok(block) => return Ok(block),
        Err(err) if err.is_out_of_memory() => {}
        Err(err) => return Err(err),
      }
    }

    self.allocate_from_new_segment(index, request, size, align)
  }

  /// `Ok(None)` when no listed segment could serve the request.
  fn allocate_from_heap(
    &self,
    index: usize,
    request: usize,
    size: usize,
    align: Align,
  ) -> Result<Option<NonNull<u8>>> {
    let Some(seg) = self.find_segment(index, request) else {
      return Ok(None);
    };
    match seg.get().allocate_aligned(size, align) {
      Ok(block) => Ok(Some(block)),
      // Another thread got there first.
      Err(err) if err.is_out_of_memory() => Ok(None),
      Err(err) => Err(err),
    }
  }

  fn find_segment(&self, index: usize, request: usize) -> Option<SegmentRef> {
    self.heaps[index].segments.read(|segments| {
      let mut fits = segments
        .iter()
        .map(|seg| (*seg, seg.get().maximum_allocation_size()))
        .filter(|&(_, max)| max >= request);

      let found = match self.strategy() {
        SearchStrategy::FirstFit => fits.next(),
        SearchStrategy::BestFit => fits.min_by_key(|&(_, max)| max),
      };
      found.map(|(seg, _)| seg)
    })
  }

  /// Moves a sufficient segment from the shared heap into heap `index`.
  fn requisition(&self, index: usize, request: usize) -> Option<SegmentRef> {
    let seg = self.heaps[SHARED_HEAP].segments.write(|segments| {
      let pos = segments
        .iter()
        .position(|seg| seg.get().maximum_allocation_size() >= request)?;
      Some(segments.remove(pos))
    })?;

    tracing::debug!(heap = index, request, "segment requisitioned from shared heap");
    self.add_segment(index, seg);
    Some(seg)
  }

  fn allocate_from_new_segment(
    &self,
    index: usize,
    request: usize,
    size: usize,
    align: Align,
  ) -> Result<NonNull<u8>> {
    let segment_size = request
      .div_ceil(self.page_size)
      .checked_mul(self.page_size)
      .ok_or(AllocError::out_of_memory(request, 0))?;

    let segment = HeapSegment::new(segment_size, index)?;
    segment.set_lock_sleep_time(self.lock_sleep_ms);
    let seg = SegmentRef(adapter::create_new(&self.segment_pool, segment)?);

    // Served before publishing, so no other thread can take the space first.
    let block = match seg.get().allocate_aligned(size, align) {
      Ok(block) => block,
      Err(err) => {
        unsafe { adapter::delete(&self.segment_pool, seg.0)? };
        return Err(err);
      }
    };

    self.registry.write(|registry| {
      let pos = registry
        .binary_search_by_key(&seg.begin(), SegmentRef::begin)
        .unwrap_or_else(|pos| pos);
      registry.insert(pos, seg);
    });
    self.add_segment(index, seg);

    tracing::debug!(
      heap = index,
      size = seg.get().committed_memory_size(),
      "new heap segment"
    );
    Ok(block)
  }

  fn add_segment(&self, index: usize, seg: SegmentRef) {
    seg.get().set_heap_owner(index);
    self.heaps[index].segments.write(|segments| segments.insert(0, seg));
  }

  /// Registered segment whose arena contains `ptr`.
  fn lookup(&self, ptr: *const u8) -> Option<SegmentRef> {
    let addr = ptr as usize;
    self.registry.read(|registry| {
      let pos = registry.partition_point(|seg| seg.begin() <= addr);
      let seg = *registry.get(pos.checked_sub(1)?)?;
      seg.get().is_memory_allocated_here(ptr).then_some(seg)
    })
  }

  /// Hands `seg` to the shared heap if it is still listed in heap `owner`.
  fn migrate_to_shared(&self, owner: usize, seg: SegmentRef) {
    let removed = self.heaps[owner].segments.write(|segments| {
      match segments.iter().position(|listed| *listed == seg) {
        Some(pos) => {
          segments.remove(pos);
          true
        }
        None => false,
      }
    });

    if removed {
      tracing::debug!(from = owner, "segment moved to shared heap");
      self.add_segment(SHARED_HEAP, seg);
    }
  }

  fn sum_over_segments(&self, f: impl Fn(&HeapSegment) -> usize) -> usize {
    self
      .heaps
      .iter()
      .map(|heap| {
        heap
          .segments
          .read(|segments| segments.iter().map(|seg| f(seg.get())).sum::<usize>())
      })
      .sum()
  }

  /// Managed bytes across all listed segments.
  pub fn committed_memory_size(&self) -> usize {
    self.sum_over_segments(HeapSegment::committed_memory_size)
  }
}

impl Allocator for HeapAllocator {
  fn allocate_aligned(&self, size: usize, align: Align) -> Result<NonNull<u8>> {
    self.allocate_for(ThreadKey::current(), size, align)
  }

  unsafe fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
    let seg = self
      .lookup(ptr.as_ptr())
      .ok_or(AllocError::WrongArgument("Memory wasn't allocated here"))?;
    let segment = seg.get();
    unsafe { segment.deallocate(ptr)? };

    let free = segment.free_memory_size();
    let used = segment.used_memory_size();
    if free > 0 && (used as f32 / free as f32) < self.free_fraction {
      let owner = segment.heap_owner();
      if owner != SHARED_HEAP {
        self.migrate_to_shared(owner, seg);
      }
    }
    Ok(())
  }

  /// The heap grows on demand.
  fn maximum_allocation_size(&self) -> usize {
    usize::MAX
  }

  fn used_memory_size(&self) -> usize {
    self.sum_over_segments(HeapSegment::used_memory_size)
  }

  fn free_memory_size(&self) -> usize {
    self.sum_over_segments(HeapSegment::free_memory_size)
  }

  fn is_memory_allocated_here(&self, ptr: *const u8) -> bool {
    self.heaps.iter().any(|heap| {
      heap.segments.read(|segments| {
        segments
          .iter()
          .any(|seg| seg.get().is_memory_allocated_here(ptr))
      })
    })
  }
}

impl Drop for HeapAllocator {
  fn drop(&mut self) {
    for seg in self.registry.get_mut().drain(..) {
      if let Err(err) = unsafe { adapter::delete(&self.segment_pool, seg.0) } {
        tracing::warn!(%err, "failed to release heap segment");
      }
    }
    for heap in self.heaps.iter_mut() {
      heap.segments.get_mut().clear();
    }
  }
}
