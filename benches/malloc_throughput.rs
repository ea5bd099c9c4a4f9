use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use firstfit::{Heap, MMAP_THRESHOLD, Region};
use std::hint::black_box;

const OPS: u64 = 10_000;

/// firstfit allocate/release throughput.
fn firstfit_allocate_release(size: usize) {
  for _ in 0..OPS {
    let ptr = firstfit::allocate(size);
    black_box(ptr);
    unsafe { firstfit::release(ptr) };
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

  for size in [16, 64, 256, 1024, 4096, MMAP_THRESHOLD] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("firstfit", size), &size, |b, &size| {
      b.iter(|| firstfit_allocate_release(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

/// First-fit scan cost over a fragmented list: every other block is free and
/// too small, the request lands past all of them.
fn benchmark_fragmented_scan(c: &mut Criterion) {
  let mut group = c.benchmark_group("fragmented_scan");

  for holes in [16usize, 256, 1024] {
    let mut heap = Heap::with_backend(Region::new(64 << 20).expect("region mapping refused"));

    let blocks: Vec<_> = (0..holes * 2).map(|_| heap.allocate(32)).collect();
    for ptr in blocks.iter().step_by(2) {
      unsafe { heap.release(*ptr) };
    }

    group.throughput(Throughput::Elements(1));
    group.bench_with_input(BenchmarkId::from_parameter(holes), &holes, |b, _| {
      b.iter(|| {
        let ptr = heap.allocate(black_box(64));
        unsafe { heap.release(ptr) };
      })
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_fragmented_scan);
criterion_main!(benches);
