use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use segheap::sync::{Locked, RwSpinLock, SpinLock};
use std::hint::black_box;

fn bench_uncontended(c: &mut Criterion) {
  let mut group = c.benchmark_group("lock_uncontended");
  group.throughput(Throughput::Elements(1));

  let spin = SpinLock::new();
  group.bench_function("spinlock", |b| b.iter(|| black_box(spin.lock())));

  let rw = RwSpinLock::new();
  group.bench_function("rw_read", |b| b.iter(|| black_box(rw.read())));
  group.bench_function("rw_write", |b| b.iter(|| black_box(rw.write())));

  group.finish();
}

fn bench_locked_batch(c: &mut Criterion) {
  let mut group = c.benchmark_group("locked_batch");

  const ITERATIONS: u64 = 1000;
  group.throughput(Throughput::Elements(ITERATIONS));

  let locked = Locked::new(0usize);

  group.bench_function("read_x1000", |b| {
    b.iter(|| {
      let mut sum = 0usize;
      for _ in 0..ITERATIONS {
        sum = sum.wrapping_add(locked.read(|v| *v));
      }
      black_box(sum)
    })
  });

  group.bench_function("write_x1000", |b| {
    b.iter(|| {
      for _ in 0..ITERATIONS {
        locked.write(|v| *v = v.wrapping_add(1));
      }
    })
  });

  group.finish();
}

criterion_group!(benches, bench_uncontended, bench_locked_batch);
criterion_main!(benches);
