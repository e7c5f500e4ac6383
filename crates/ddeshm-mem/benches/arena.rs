// Fragment arena benchmarks
//
// These measure first-fit allocation and coalescing free over a 64 KiB
// region, the size of a fresh shared segment.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ddeshm_mem::{Arena, HeapRegion};

const SEGMENT: usize = 64 * 1024;

/// Allocate and immediately free a single block of each size.
fn bench_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free");

    for size in &[16usize, 64, 256, 1024, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let region = HeapRegion::new(SEGMENT).unwrap();
            let arena = unsafe { Arena::create(region.base(), 0, region.len()) };
            b.iter(|| {
                let off = arena.alloc(black_box(size)).unwrap();
                arena.free(off).unwrap();
            });
        });
    }

    group.finish();
}

/// Fill the arena with mixed sizes, then free every other block and
/// refill the holes. Exercises the free-list walk on a fragmented arena.
fn bench_fragmented_refill(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragmented");

    group.bench_function("refill_holes", |b| {
        let region = HeapRegion::new(SEGMENT).unwrap();
        let sizes = [24usize, 100, 300, 48, 700];

        b.iter(|| {
            let arena = unsafe { Arena::create(region.base(), 0, region.len()) };
            let mut live = Vec::new();
            let mut i = 0;
            while let Some(off) = arena.alloc(sizes[i % sizes.len()]) {
                live.push(off);
                i += 1;
            }
            for off in live.iter().step_by(2) {
                arena.free(*off).unwrap();
            }
            while arena.alloc(black_box(64)).is_some() {}
        });
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free, bench_fragmented_refill);
criterion_main!(benches);
