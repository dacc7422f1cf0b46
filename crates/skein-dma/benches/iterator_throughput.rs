//! Benchmark for transfer-iterator chunking throughput

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use skein_dma::{FieldSlice, MemoryKind, MemoryStore, NodeId, RegionInstance, TransferIterator};
use skein_base::{IndexSpace, Point, Rect};

fn bench_dense_1d(c: &mut Criterion) {
    let store = MemoryStore::new();
    let mem = store.create_memory(NodeId(0), MemoryKind::SystemLocal, 64 << 20);
    let space = IndexSpace::dense(Rect::span(0, (1 << 20) - 1));
    let inst = RegionInstance::create(&store, mem, &space, &[8]).unwrap();

    c.bench_function("iterate_1m_elements_64k_chunks", |b| {
        b.iter(|| {
            let mut it =
                TransferIterator::new(&space, inst.clone(), vec![FieldSlice::whole(0, 8)], 0);
            let mut total = 0usize;
            while !it.done() {
                let info = it.step(1 << 16, false).unwrap();
                total += info.total_bytes();
            }
            black_box(total);
        })
    });
}

fn bench_dense_2d(c: &mut Criterion) {
    let store = MemoryStore::new();
    let mem = store.create_memory(NodeId(0), MemoryKind::SystemLocal, 64 << 20);
    let bounds = Rect::new(Point([0, 0]), Point([1023, 1023]));
    let space = IndexSpace::dense(bounds);
    let inst = RegionInstance::create(&store, mem, &space, &[4]).unwrap();
    // a narrow window forces row-by-row chunking
    let window = IndexSpace::dense(Rect::new(Point([128, 0]), Point([383, 1023])));

    c.bench_function("iterate_2d_window_rows", |b| {
        b.iter(|| {
            let mut it =
                TransferIterator::new(&window, inst.clone(), vec![FieldSlice::whole(0, 4)], 0);
            let mut chunks = 0usize;
            while !it.done() {
                let info = it.step(1 << 16, false).unwrap();
                black_box(info);
                chunks += 1;
            }
            black_box(chunks);
        })
    });
}

criterion_group!(benches, bench_dense_1d, bench_dense_2d);
criterion_main!(benches);
