use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::hint::black_box;

const OPS: u64 = 100_000;
const CHURN_SLOTS: usize = 64;

/// segmalloc alloc/free throughput.
fn segmalloc_malloc_free(size: usize) {
  for _ in 0..OPS {
    let ptr = segmalloc::malloc(size);
    black_box(ptr);
    segmalloc::free(ptr);
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

/// Random frees and reallocations over a fixed set of live slots, so blocks
/// split and coalesce instead of cycling through one quick list.
fn segmalloc_churn(sizes: &[usize]) {
  let mut slots = [core::ptr::null_mut::<u8>(); CHURN_SLOTS];
  for (i, &size) in sizes.iter().enumerate() {
    let slot = &mut slots[i % CHURN_SLOTS];
    if !slot.is_null() {
      segmalloc::free(*slot);
    }
    *slot = segmalloc::malloc(size);
    black_box(*slot);
  }
  for ptr in slots.into_iter().filter(|ptr| !ptr.is_null()) {
    segmalloc::free(ptr);
  }
}

fn libc_churn(sizes: &[usize]) {
  let mut slots = [core::ptr::null_mut::<libc::c_void>(); CHURN_SLOTS];
  for (i, &size) in sizes.iter().enumerate() {
    let slot = &mut slots[i % CHURN_SLOTS];
    unsafe {
      libc::free(*slot);
      *slot = libc::malloc(size);
    }
    black_box(*slot);
  }
  for ptr in slots {
    unsafe { libc::free(ptr) };
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_throughput");

  // 16 and 64 hit the quick lists; the rest go through the free lists.
  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("segmalloc", size), &size, |b, &size| {
      b.iter(|| segmalloc_malloc_free(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

fn benchmark_churn(c: &mut Criterion) {
  let mut group = c.benchmark_group("churn");
  let mut rng = StdRng::seed_from_u64(0x5E6);

  for max in [176, 1024, 2048] {
    let sizes: Vec<usize> = (0..10_000).map(|_| rng.gen_range(1..=max)).collect();
    group.throughput(Throughput::Elements(sizes.len() as u64));

    group.bench_with_input(BenchmarkId::new("segmalloc", max), &sizes, |b, sizes| {
      b.iter(|| segmalloc_churn(sizes))
    });

    group.bench_with_input(BenchmarkId::new("libc", max), &sizes, |b, sizes| {
      b.iter(|| libc_churn(sizes))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_churn);
criterion_main!(benches);
