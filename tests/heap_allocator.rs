use proptest::{
  prelude::Rng,
  test_runner::{RngAlgorithm, TestRng},
};
use segheap::{
  Align, Allocator, HeapAllocator, HeapConfig, SearchStrategy, ThreadKey, heap::SHARED_HEAP,
};
use std::{ptr::NonNull, sync::Arc, thread};

const THREADS: usize = 4;
const ALLOCATIONS_PER_THREAD: usize = 1000;

fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

fn config() -> HeapConfig {
  HeapConfig::default()
    .with_page_size_kb(16)
    .with_heap_count(4)
    .with_free_fraction(0.1)
    .with_strategy(SearchStrategy::BestFit)
}

/// Random sizes, a byte pattern per block, release in shuffled order.
fn churn(heap: &HeapAllocator, seed: u8) {
  let mut rng = TestRng::from_seed(RngAlgorithm::ChaCha, &[seed; 32]);
  let mut blocks: Vec<(NonNull<u8>, usize, u8)> = Vec::with_capacity(ALLOCATIONS_PER_THREAD);

  for i in 0..ALLOCATIONS_PER_THREAD {
    let size = rng.gen_range(8..=2048);
    let tag = seed.wrapping_add(i as u8);
    let block = heap.allocate(size).unwrap();
    unsafe { block.as_ptr().write_bytes(tag, size) };
    blocks.push((block, size, tag));
  }

  for i in (1..blocks.len()).rev() {
    let j = rng.gen_range(0..=i);
    blocks.swap(i, j);
  }

  for (block, size, tag) in blocks {
    let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), size) };
    assert!(bytes.iter().all(|&b| b == tag), "block overwritten");
    unsafe { heap.deallocate(block).unwrap() };
  }
}

#[test]
fn concurrent_churn_returns_everything() {
  init_tracing();
  let heap = Arc::new(HeapAllocator::new(config()).unwrap());

  let handles: Vec<_> = (0..THREADS)
    .map(|t| {
      let heap = Arc::clone(&heap);
      thread::spawn(move || churn(&heap, t as u8 * 64))
    })
    .collect();
  for handle in handles {
    handle.join().unwrap();
  }

  assert_eq!(heap.used_memory_size(), 0);
  assert_eq!(heap.free_memory_size(), heap.committed_memory_size());
  assert!(heap.committed_memory_size() > 0);
}

#[test]
fn first_fit_churn() {
  init_tracing();
  let heap = HeapAllocator::new(config().with_strategy(SearchStrategy::FirstFit)).unwrap();
  churn(&heap, 7);
  assert_eq!(heap.used_memory_size(), 0);
}

#[test]
fn explicit_keys_spread_over_heaps() {
  init_tracing();
  let heap = HeapAllocator::new(config()).unwrap();

  let blocks: Vec<_> = (0..8u64)
    .map(|key| {
      let key = ThreadKey::new(key);
      let block = heap.allocate_for(key, 256, Align::ONE).unwrap();
      assert_eq!(heap.heap_of(block.as_ptr()), Some(heap.heap_index_for(key)));
      block
    })
    .collect();

  for index in 1..=heap.heap_count() {
    assert_eq!(heap.segment_count(index), 1);
  }
  assert_eq!(heap.segment_count(SHARED_HEAP), 0);

  for block in blocks {
    unsafe { heap.deallocate(block).unwrap() };
  }
  assert_eq!(heap.segment_count(SHARED_HEAP), heap.heap_count());
  assert_eq!(heap.used_memory_size(), 0);
}

#[test]
fn mostly_free_segment_moves_to_shared_heap() {
  init_tracing();
  let heap = HeapAllocator::new(config().with_heap_count(1)).unwrap();
  let key = ThreadKey::new(0);
  const BLOCK: usize = 512;

  let blocks: Vec<_> = (0..63)
    .map(|i| {
      let block = heap.allocate_for(key, BLOCK, Align::ONE).unwrap();
      let tag = (i + 1) as u8;
      unsafe { block.as_ptr().write_bytes(tag, BLOCK) };
      (block, tag)
    })
    .collect();
  assert_eq!(heap.segment_count(1), 3);
  assert_eq!(heap.segment_count(SHARED_HEAP), 0);

  // The first segment is carved from its start, so its blocks sit right after the first.
  let first = blocks[0].0.as_ptr() as usize;
  let (in_first, elsewhere): (Vec<_>, Vec<_>) = blocks.into_iter().partition(|(block, _)| {
    let addr = block.as_ptr() as usize;
    addr >= first && addr < first + 16 * 1024
  });
  assert!(in_first.len() > 3);

  // Keep the first block live and release the rest of its segment.
  let (kept, kept_tag) = in_first[0];
  for &(block, _) in &in_first[1..] {
    unsafe { heap.deallocate(block).unwrap() };
  }

  assert_eq!(heap.heap_of(kept.as_ptr()), Some(SHARED_HEAP));
  assert_eq!(heap.segment_count(SHARED_HEAP), 1);
  assert_eq!(heap.segment_count(1), 2);
  for (block, _) in &elsewhere {
    assert_eq!(heap.heap_of(block.as_ptr()), Some(1));
  }

  let used = heap.used_memory_size();
  assert!(used > 0);
  let bytes = unsafe { std::slice::from_raw_parts(kept.as_ptr(), BLOCK) };
  assert!(bytes.iter().all(|&b| b == kept_tag));

  unsafe { heap.deallocate(kept).unwrap() };
  for (block, _) in elsewhere {
    unsafe { heap.deallocate(block).unwrap() };
  }
  assert_eq!(heap.used_memory_size(), 0);
}

#[test]
fn aligned_allocations() {
  init_tracing();
  let heap = HeapAllocator::new(config()).unwrap();
  let mut rng = TestRng::deterministic_rng(RngAlgorithm::ChaCha);

  let blocks: Vec<_> = (0..200)
    .map(|_| {
      let align = Align::new(1 << rng.gen_range(0..13u32)).unwrap();
      let block = heap
        .allocate_aligned(rng.gen_range(1..=512), align)
        .unwrap();
      assert_eq!(block.as_ptr() as usize % align.value(), 0);
      block
    })
    .collect();

  for block in blocks.into_iter().rev() {
    unsafe { heap.deallocate(block).unwrap() };
  }
  assert_eq!(heap.used_memory_size(), 0);
}
