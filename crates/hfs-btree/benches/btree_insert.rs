#![forbid(unsafe_code)]
//! Benchmark: catalog-style inserts and point lookups.
//!
//! Inserts go through a direct journal, so each measures the node split and
//! header bookkeeping plus the cache write path.

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use hfs_alloc::{AllocGeometry, Allocator, AllocatorConfig};
use hfs_block::{BufferCache, CacheConfig, MemoryByteDevice};
use hfs_btree::{BTree, TreeParams, compare};
use hfs_journal::{Journal, JournalConfig};
use hfs_ondisk::{CatalogKey, CatalogRecord, ExtentDescriptor, ExtentMap, FileRecord, UniName};
use hfs_types::{Cnid, FileId};
use std::sync::Arc;

const BS: u32 = 4096;
const TOTAL: u32 = 4096;
const NODE: u16 = 4096;

fn setup() -> (Journal, BTree) {
    let dev = MemoryByteDevice::new(BS as usize * TOTAL as usize);
    let cache = BufferCache::new(Arc::new(dev), CacheConfig::default());
    let journal = Journal::direct(cache.clone(), JournalConfig::default());
    let bitmap = ExtentDescriptor::new(0, 1);
    let allocator = Allocator::new(
        cache.clone(),
        AllocGeometry {
            total_blocks: TOTAL,
            block_size: BS,
            volume_offset: 0,
            bitmap: ExtentMap::new(BS, 0, vec![bitmap]),
        },
        AllocatorConfig::default(),
        TOTAL,
        0,
    )
    .expect("allocator");
    let params = TreeParams::catalog(NODE, false);
    let tree = {
        let mut txn = journal.begin().expect("begin");
        allocator.mark_used(&mut txn, bitmap).expect("bitmap");
        let tree = BTree::create(
            &mut txn,
            cache,
            FileId::CATALOG,
            allocator,
            &params,
            compare::for_file(FileId::CATALOG, params.key_compare_type),
        )
        .expect("tree");
        txn.commit().expect("commit");
        tree
    };
    (journal, tree)
}

fn record(i: u32) -> (Vec<u8>, Vec<u8>) {
    let name = UniName::from_str_lossless(&format!("file-{i:06}")).expect("name");
    let key = CatalogKey::new(Cnid::ROOT_FOLDER, name).encode();
    let data = CatalogRecord::File(FileRecord::new(Cnid(16 + i), 0))
        .encode()
        .expect("record");
    (key, data)
}

fn fill(journal: &Journal, tree: &BTree, records: &[(Vec<u8>, Vec<u8>)]) {
    let mut txn = journal.begin().expect("begin");
    for (key, data) in records {
        tree.insert(&mut txn, key, data).expect("insert");
    }
    txn.commit().expect("commit");
}

// ── Benchmarks ──────────────────────────────────────────────────────────

fn bench_insert(c: &mut Criterion) {
    let records: Vec<_> = (0..2000).map(record).collect();
    c.bench_function("btree_insert_2000_catalog", |b| {
        b.iter_batched(
            setup,
            |(journal, tree)| fill(&journal, &tree, black_box(&records)),
            BatchSize::LargeInput,
        );
    });
}

fn bench_lookup(c: &mut Criterion) {
    let records: Vec<_> = (0..2000).map(record).collect();
    let (journal, tree) = setup();
    fill(&journal, &tree, &records);
    let wanted = &records[1234].0;
    c.bench_function("btree_lookup_catalog", |b| {
        b.iter(|| tree.lookup(black_box(wanted)).expect("lookup"));
    });
}

criterion_group!(benches, bench_insert, bench_lookup);
criterion_main!(benches);
