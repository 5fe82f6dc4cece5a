#![forbid(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use hfs_block::{BufKey, BufferCache, CacheConfig, GetMode, MemoryByteDevice, ReleaseMode};
use hfs_types::{ByteOffset, FileId};
use std::sync::Arc;

const NODE: usize = 4096;

fn make_cache(nodes: usize, capacity: usize) -> BufferCache {
    let dev = MemoryByteDevice::new(NODE * nodes);
    BufferCache::new(
        Arc::new(dev),
        CacheConfig {
            capacity_nodes: capacity,
            max_dirty_buffers: capacity,
        },
    )
}

fn get(cache: &BufferCache, node: u64) -> hfs_block::BufGuard {
    cache
        .get(
            BufKey::new(FileId::CATALOG, node),
            ByteOffset(node * NODE as u64),
            NODE,
            GetMode::Read,
        )
        .expect("get")
}

// ── Benchmarks ──────────────────────────────────────────────────────────

fn bench_cache_hit(c: &mut Criterion) {
    let cache = make_cache(16, 8);
    drop(get(&cache, 0));

    c.bench_function("buffer_cache_hit_4k", |b| {
        b.iter(|| {
            let guard = get(&cache, black_box(0));
            drop(guard);
        });
    });
}

fn bench_cache_miss(c: &mut Criterion) {
    // Capacity 1: every distinct node evicts the previous one.
    let cache = make_cache(256, 1);
    let mut node = 0_u64;
    c.bench_function("buffer_cache_miss_4k", |b| {
        b.iter(|| {
            drop(get(&cache, black_box(node % 256)));
            node += 1;
        });
    });
}

fn bench_dirty_release_and_flush(c: &mut Criterion) {
    let cache = make_cache(64, 64);
    c.bench_function("buffer_cache_dirty_flush_32", |b| {
        b.iter(|| {
            for node in 0..32_u64 {
                let mut guard = get(&cache, node);
                guard[0] = guard[0].wrapping_add(1);
                guard.release(ReleaseMode::MarkDirty(None)).expect("dirty");
            }
            black_box(cache.flush_dirty().expect("flush"));
        });
    });
}

criterion_group!(
    cache_benches,
    bench_cache_hit,
    bench_cache_miss,
    bench_dirty_release_and_flush,
);
criterion_main!(cache_benches);
