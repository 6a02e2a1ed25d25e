//! # Allocator Benchmark
//!
//! Per-frame allocation patterns against every strategy:
//! 1. Freelist churn - mixed sizes, random frees (host and device)
//! 2. Pool churn - fixed slots allocated and freed in bursts
//! 3. Scratch frames - bump allocations followed by one reset

#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lumen_memory::{
    Allocator, DeviceFreelistAllocator, DeviceHeap, FreelistConfig, HeapConfig,
    HostFreelistAllocator, HostHeap, LeafAllocator, MonotonicAllocator, MonotonicConfig,
    PoolAllocator, PoolConfig,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const OPERATIONS: usize = 10_000;

/// Deterministic (size, alignment, free index) triples.
fn generate_requests(count: usize, seed: u64) -> Vec<(u64, u64, usize)> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let size = rng.gen_range(16..=4096u64);
            let alignment = 1u64 << rng.gen_range(4..=8u32);
            (size, alignment, rng.gen_range(0..usize::MAX))
        })
        .collect()
}

fn churn<A: Allocator>(allocator: &mut A, requests: &[(u64, u64, usize)]) {
    let mut live = Vec::with_capacity(requests.len());
    for (i, &(size, alignment, pick)) in requests.iter().enumerate() {
        if i % 3 == 2 && !live.is_empty() {
            let address = live.swap_remove(pick % live.len());
            allocator.deallocate(address).ok();
        } else if let Ok(address) = allocator.allocate(size, alignment) {
            live.push(address);
        }
    }
    for address in live {
        allocator.deallocate(address).ok();
    }
}

// =============================================================================
// FREELIST BENCHMARKS
// =============================================================================

fn bench_host_freelist(c: &mut Criterion) {
    let requests = generate_requests(OPERATIONS, 42);
    let leaf = LeafAllocator::new(HostHeap::new(HeapConfig::default()));
    let mut freelist =
        HostFreelistAllocator::new(leaf, FreelistConfig::new(64 << 20, 256)).unwrap();

    c.bench_function("host_freelist_churn_10k", |b| {
        b.iter(|| {
            churn(&mut freelist, black_box(&requests));
        });
    });
}

fn bench_device_freelist(c: &mut Criterion) {
    let requests = generate_requests(OPERATIONS, 42);
    let leaf = LeafAllocator::new(DeviceHeap::new(HeapConfig::default()));
    let mut freelist =
        DeviceFreelistAllocator::new(leaf, FreelistConfig::new(64 << 20, 256)).unwrap();

    c.bench_function("device_freelist_churn_10k", |b| {
        b.iter(|| {
            churn(&mut freelist, black_box(&requests));
        });
    });
}

// =============================================================================
// POOL BENCHMARKS
// =============================================================================

fn bench_pool(c: &mut Criterion) {
    let leaf = LeafAllocator::new(DeviceHeap::new(HeapConfig::default()));
    let freelist = DeviceFreelistAllocator::new(leaf, FreelistConfig::new(64 << 20, 256)).unwrap();
    let mut pool = PoolAllocator::new(freelist, PoolConfig::new(256, 256)).unwrap();
    let mut slots = Vec::with_capacity(1000);

    c.bench_function("pool_burst_1000", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                slots.push(pool.allocate(256, 256).unwrap());
            }
            for slot in slots.drain(..) {
                pool.deallocate(black_box(slot)).unwrap();
            }
        });
    });
}

// =============================================================================
// MONOTONIC BENCHMARKS
// =============================================================================

fn bench_scratch_frame(c: &mut Criterion) {
    let requests = generate_requests(OPERATIONS, 7);
    let leaf = LeafAllocator::new(HostHeap::new(HeapConfig::default()));
    let freelist = HostFreelistAllocator::new(leaf, FreelistConfig::new(64 << 20, 256)).unwrap();
    let mut scratch = MonotonicAllocator::new(freelist, MonotonicConfig::new(1 << 20, 256)).unwrap();

    c.bench_function("scratch_frame_10k", |b| {
        b.iter(|| {
            for &(size, alignment, _) in &requests {
                black_box(scratch.allocate(size, alignment).unwrap());
            }
            scratch.reset().unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_host_freelist,
    bench_device_freelist,
    bench_pool,
    bench_scratch_frame,
);
criterion_main!(benches);
