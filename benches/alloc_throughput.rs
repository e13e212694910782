use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use segheap::{
  Align, Allocator, HeapAllocator, HeapConfig, LinearAllocator, PoolAllocator, ThreadKey,
};
use std::hint::black_box;

const OPS: u64 = 100_000;

/// Heap alloc/free throughput.
fn heap_malloc_free(heap: &HeapAllocator, size: usize) {
  let key = ThreadKey::current();
  for _ in 0..OPS {
    let ptr = heap.allocate_for(key, size, Align::ONE).unwrap();
    black_box(ptr);
    unsafe { heap.deallocate(ptr).unwrap() };
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_throughput");
  let heap = HeapAllocator::new(HeapConfig::default()).unwrap();

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("heap", size), &size, |b, &size| {
      b.iter(|| heap_malloc_free(&heap, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

fn benchmark_fixed_size(c: &mut Criterion) {
  let mut group = c.benchmark_group("fixed_size");
  group.throughput(Throughput::Elements(OPS));

  let pool = PoolAllocator::<[u64; 8]>::new(1024, Align::ONE).unwrap();
  group.bench_function("pool", |b| {
    b.iter(|| {
      for _ in 0..OPS {
        let slot = pool.allocate_element().unwrap();
        black_box(slot);
        unsafe { pool.deallocate_element(slot).unwrap() };
      }
    })
  });

  let linear = LinearAllocator::new(OPS as usize * 64).unwrap();
  group.bench_function("linear", |b| {
    b.iter(|| {
      for _ in 0..OPS {
        black_box(linear.allocate(64).unwrap());
      }
      linear.clear();
    })
  });

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_fixed_size);
criterion_main!(benches);
