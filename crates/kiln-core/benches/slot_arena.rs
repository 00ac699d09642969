//! Benchmarks for SlotArena

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use kiln_core::alloc::{IndexSlot, SlotArena};

fn bench_slot_arena_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_arena_insert");

    for size in [10, 100, 1000, 10000] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut arena = SlotArena::new();
                for i in 0..size {
                    let _ = arena.try_insert(black_box(i));
                }
                arena
            });
        });
    }

    group.finish();
}

fn bench_slot_arena_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_arena_churn");

    for size in [100, 1000, 10000] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut arena = SlotArena::new();
                let slots: Vec<IndexSlot> = (0..size)
                    .filter_map(|i| arena.try_insert(i).ok())
                    .collect();
                for slot in slots.iter().step_by(2) {
                    arena.remove(*slot);
                }
                for i in 0..size / 2 {
                    let _ = arena.try_insert(black_box(i));
                }
                arena.len()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_slot_arena_insert, bench_slot_arena_churn);
criterion_main!(benches);
