//! # Arena Allocation Benchmark
//!
//! Small-block churn through each arena kind against the system allocator.
//!
//! Run with: `cargo bench --package larder_core`

#![allow(missing_docs)]
#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::NonNull;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use larder_core::{
    AllocRequest, Arena, ArenaAllocator, FixedArena, FixedArenaConfig, FixedMemoryTable,
    HeapArena, LocalLock, LockKind, TableConfig,
};

/// Blocks held live per iteration.
const BATCH: usize = 1_000;

/// Allocates `BATCH` blocks of `size` bytes, then releases them all.
fn churn<A: Arena + ?Sized>(arena: &A, size: usize, live: &mut Vec<NonNull<u8>>) {
    for _ in 0..BATCH {
        if let Some(ptr) = arena.allocate(AllocRequest::new(size)) {
            live.push(ptr);
        }
    }
    for ptr in live.drain(..) {
        // SAFETY: every pointer came from `arena` with this size.
        let released = unsafe { arena.deallocate(Some(ptr), size) };
        debug_assert!(released.is_ok());
    }
}

fn bench_fixed_size_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("fixed_size_churn");

    for size in [16usize, 64, 256] {
        let heap = HeapArena::new();
        let shared: FixedArena = FixedArena::new(&FixedArenaConfig::new(size)).unwrap();
        let local: FixedArena<LocalLock> = FixedArena::new(&FixedArenaConfig {
            lock: LockKind::Local,
            ..FixedArenaConfig::new(size)
        })
        .unwrap();
        let mut live = Vec::with_capacity(BATCH);

        group.bench_with_input(BenchmarkId::new("heap", size), &size, |b, &size| {
            b.iter(|| churn(&heap, black_box(size), &mut live));
        });
        group.bench_with_input(BenchmarkId::new("pool_mutex", size), &size, |b, &size| {
            b.iter(|| churn(&shared, black_box(size), &mut live));
        });
        group.bench_with_input(BenchmarkId::new("pool_local", size), &size, |b, &size| {
            b.iter(|| churn(&local, black_box(size), &mut live));
        });
        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &size| {
            let layout = Layout::from_size_align(size, 8).unwrap();
            let mut raw = Vec::with_capacity(BATCH);
            b.iter(|| {
                for _ in 0..BATCH {
                    // SAFETY: non-zero layout.
                    raw.push(unsafe { System.alloc(black_box(layout)) });
                }
                for ptr in raw.drain(..) {
                    // SAFETY: allocated above with the same layout.
                    unsafe { System.dealloc(ptr, layout) };
                }
            });
        });
    }

    group.finish();
}

fn bench_table_mixed_sizes(c: &mut Criterion) {
    let table: FixedMemoryTable = FixedMemoryTable::new(&TableConfig::default()).unwrap();
    let heap = HeapArena::new();
    let sizes: Vec<usize> = (0..BATCH).map(|i| 1 + (i * 37) % 64).collect();

    let mut group = c.benchmark_group("mixed_sizes");
    for (label, arena) in [("table", &table as &dyn Arena), ("heap", &heap as &dyn Arena)] {
        let mut live = Vec::with_capacity(BATCH);
        group.bench_function(label, |b| {
            b.iter(|| {
                for &size in &sizes {
                    if let Some(ptr) = arena.allocate(AllocRequest::new(size)) {
                        live.push((ptr, size));
                    }
                }
                for (ptr, size) in live.drain(..) {
                    // SAFETY: allocated above with this size.
                    let released = unsafe { arena.deallocate(Some(ptr), size) };
                    debug_assert!(released.is_ok());
                }
            });
        });
    }
    group.finish();
}

fn bench_container_growth(c: &mut Criterion) {
    let table: FixedMemoryTable = FixedMemoryTable::new(&TableConfig {
        small_size: 512,
        ..TableConfig::default()
    })
    .unwrap();

    c.bench_function("vec_push_10k_over_table", |b| {
        b.iter(|| {
            let mut values = allocator_api2::vec::Vec::new_in(ArenaAllocator::<u64, _>::new(&table));
            for value in 0..10_000u64 {
                values.push(black_box(value));
            }
            values.len()
        });
    });
}

criterion_group!(
    benches,
    bench_fixed_size_churn,
    bench_table_mixed_sizes,
    bench_container_growth,
);

criterion_main!(benches);
