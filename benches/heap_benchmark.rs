use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use strata_renderer::backend::heap::BlockAllocator;

const VERTEX_SIZE: u64 = 48;

fn bench_allocate_free_single(c: &mut Criterion) {
    let mut heap = BlockAllocator::new("vertex", 128 << 20, VERTEX_SIZE);

    c.bench_function("heap_allocate_free_24_vertices", |b| {
        b.iter(|| {
            let (index, _) = heap.allocate(black_box(24), VERTEX_SIZE).unwrap();
            black_box(heap.free(index).unwrap());
        })
    });
}

fn bench_fragmented_churn(c: &mut Criterion) {
    c.bench_function("heap_churn_1000_meshes", |b| {
        b.iter(|| {
            let mut heap = BlockAllocator::new("vertex", 64 << 20, VERTEX_SIZE);
            let mut live = Vec::with_capacity(1000);
            for i in 0..1000u32 {
                let (index, _) = heap.allocate(24 + i % 97, VERTEX_SIZE).unwrap();
                live.push(index);
            }
            // Free every other block, then refill the holes
            for index in live.iter().step_by(2) {
                heap.free(*index).unwrap();
            }
            for i in 0..500u32 {
                black_box(heap.allocate(8 + i % 13, VERTEX_SIZE).unwrap());
            }
            black_box(heap.stats());
        })
    });
}

fn bench_exhausted_lookup(c: &mut Criterion) {
    let mut heap = BlockAllocator::new("index", 1 << 20, 4);
    while heap.allocate(1024, 4).is_ok() {}

    c.bench_function("heap_allocate_when_full", |b| {
        b.iter(|| {
            black_box(heap.allocate(black_box(6), 4).is_err());
        })
    });
}

criterion_group!(
    benches,
    bench_allocate_free_single,
    bench_fragmented_churn,
    bench_exhausted_lookup,
);
criterion_main!(benches);
