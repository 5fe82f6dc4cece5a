#![forbid(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
//! Allocator behavior over a bitmap stored in a small in-memory volume.

use asupersync::Cx;
use hfs_alloc::bitmap::{clear_bits, set_bits};
use hfs_alloc::{AllocGeometry, AllocRequest, Allocator, AllocatorConfig, AllocatorError};
use hfs_block::{BufferCache, CacheConfig, DeviceEvent, MemoryByteDevice};
use hfs_journal::{Journal, JournalConfig};
use hfs_ondisk::{ExtentDescriptor, ExtentMap};
use hfs_types::ByteOffset;
use proptest::prelude::*;
use proptest::sample::Index;
use std::sync::Arc;

const BS: u32 = 512;
const TOTAL: u32 = 1024;
const BITMAP_BLOCK: u32 = 2;
const JOURNAL_START: u32 = 960;
const JOURNAL_BLOCKS: u32 = 64;

fn ext(start: u32, count: u32) -> ExtentDescriptor {
    ExtentDescriptor::new(start, count)
}

/// A volume whose bitmap marks everything used except `free`.
fn volume(free: &[(u32, u32)]) -> MemoryByteDevice {
    let mut image = vec![0_u8; (TOTAL * BS) as usize];
    let at = (BITMAP_BLOCK * BS) as usize;
    let bm = &mut image[at..at + BS as usize];
    set_bits(bm, 0, TOTAL as usize);
    for &(start, count) in free {
        clear_bits(bm, start as usize, count as usize);
    }
    MemoryByteDevice::from_bytes(image)
}

fn geometry() -> AllocGeometry {
    AllocGeometry {
        total_blocks: TOTAL,
        block_size: BS,
        volume_offset: 0,
        bitmap: ExtentMap::new(BS, 0, vec![ext(BITMAP_BLOCK, 1)]),
    }
}

fn free_count(free: &[(u32, u32)]) -> u32 {
    free.iter().map(|&(_, c)| c).sum()
}

fn direct(
    free: &[(u32, u32)],
    config: AllocatorConfig,
    next: u32,
) -> (MemoryByteDevice, Journal, Allocator) {
    let dev = volume(free);
    let cache = BufferCache::new(Arc::new(dev.clone()), CacheConfig::default());
    let journal = Journal::direct(cache.clone(), JournalConfig::default());
    let alloc = Allocator::new(cache, geometry(), config, free_count(free), next).expect("alloc");
    (dev, journal, alloc)
}

fn logged(free: &[(u32, u32)]) -> (MemoryByteDevice, Journal, Allocator) {
    let dev = volume(free);
    let cache = BufferCache::new(Arc::new(dev.clone()), CacheConfig::default());
    let journal = Journal::create(
        cache.clone(),
        ByteOffset(u64::from(JOURNAL_START * BS)),
        u64::from(JOURNAL_BLOCKS * BS),
        JournalConfig::default(),
    )
    .expect("journal");
    let alloc = Allocator::new(
        cache,
        geometry(),
        AllocatorConfig::default(),
        free_count(free),
        0,
    )
    .expect("alloc");
    let _ = dev.take_events();
    (dev, journal, alloc)
}

fn allocate(journal: &Journal, alloc: &Allocator, request: AllocRequest) -> ExtentDescriptor {
    let mut txn = journal.begin().expect("begin");
    let run = alloc.allocate(&mut txn, request).expect("allocate");
    txn.commit().expect("commit");
    run
}

#[test]
fn roving_allocation_moves_past_first_run() {
    let (_dev, journal, alloc) = direct(&[(50, 10), (200, 10)], AllocatorConfig::default(), 50);
    assert_eq!(allocate(&journal, &alloc, AllocRequest::exact(5)), ext(50, 5));
    assert_eq!(allocate(&journal, &alloc, AllocRequest::exact(5)), ext(55, 5));
    assert_eq!(allocate(&journal, &alloc, AllocRequest::exact(5)), ext(200, 5));
    assert_eq!(alloc.next_allocation(), 205);
    assert_eq!(alloc.free_blocks(), 5);
}

#[test]
fn roving_allocation_with_seeded_cache() {
    let (_dev, journal, alloc) = direct(&[(50, 10), (200, 10)], AllocatorConfig::default(), 50);
    alloc.scan(&Cx::for_testing()).expect("scan");
    assert_eq!(alloc.cached_extents(), vec![ext(50, 10), ext(200, 10)]);
    assert_eq!(allocate(&journal, &alloc, AllocRequest::exact(5)), ext(50, 5));
    assert_eq!(allocate(&journal, &alloc, AllocRequest::exact(5)), ext(55, 5));
    assert_eq!(allocate(&journal, &alloc, AllocRequest::exact(5)), ext(200, 5));
    assert!(alloc.stats().cache_hits >= 3);
}

#[test]
fn freed_low_run_wins_over_cached_high_run() {
    // One cache slot: the larger run at 200 keeps it when 50..55 is freed.
    let config = AllocatorConfig {
        free_extent_cache_capacity: 1,
        ..AllocatorConfig::default()
    };
    let (_dev, journal, alloc) = direct(&[(200, 10)], config, 0);
    alloc.scan(&Cx::for_testing()).expect("scan");
    assert_eq!(alloc.cached_extents(), vec![ext(200, 10)]);

    let mut txn = journal.begin().expect("begin");
    alloc.free(&mut txn, ext(50, 5)).expect("free");
    txn.commit().expect("commit");
    assert_eq!(alloc.cached_extents(), vec![ext(200, 10)]);

    assert_eq!(allocate(&journal, &alloc, AllocRequest::exact(5)), ext(50, 5));
    assert_eq!(allocate(&journal, &alloc, AllocRequest::exact(5)), ext(200, 5));
    assert_eq!(alloc.free_blocks(), 5);
}

#[test]
fn search_wraps_to_volume_start() {
    let (_dev, journal, alloc) = direct(&[(10, 10)], AllocatorConfig::default(), 500);
    assert_eq!(allocate(&journal, &alloc, AllocRequest::exact(5)), ext(10, 5));
}

#[test]
fn explicit_hint_leaves_roving_pointer() {
    let (_dev, journal, alloc) = direct(&[(10, 10), (300, 100)], AllocatorConfig::default(), 10);
    assert_eq!(
        allocate(&journal, &alloc, AllocRequest::range(2, 8).at(300)),
        ext(300, 8)
    );
    assert_eq!(alloc.next_allocation(), 10);
}

#[test]
fn partial_allocation_takes_largest_run() {
    let (_dev, journal, alloc) = direct(&[(10, 4), (100, 7)], AllocatorConfig::default(), 0);
    let mut txn = journal.begin().expect("begin");
    let err = alloc
        .allocate(&mut txn, AllocRequest::range(10, 20))
        .expect_err("nothing holds 10 blocks");
    assert!(matches!(err, AllocatorError::NoSpace { requested: 10 }));
    let run = alloc
        .allocate(&mut txn, AllocRequest::range(10, 20).partial())
        .expect("partial");
    txn.commit().expect("commit");
    assert_eq!(run, ext(100, 7));
    assert_eq!(alloc.free_blocks(), 4);
    assert_eq!(alloc.stats().partial_allocations, 1);
}

#[test]
fn full_volume_reports_no_space() {
    let (_dev, journal, alloc) = direct(&[], AllocatorConfig::default(), 0);
    let mut txn = journal.begin().expect("begin");
    let err = alloc
        .allocate(&mut txn, AllocRequest::exact(1).partial())
        .expect_err("full");
    assert!(hfs_error::HfsError::from(err).is_exhaustion());
    txn.commit().expect("commit");
}

#[test]
fn invalid_request_is_rejected() {
    let (_dev, journal, alloc) = direct(&[(10, 10)], AllocatorConfig::default(), 0);
    let mut txn = journal.begin().expect("begin");
    assert!(matches!(
        alloc.allocate(&mut txn, AllocRequest::range(0, 4)),
        Err(AllocatorError::InvalidRequest(_))
    ));
    assert!(matches!(
        alloc.allocate(&mut txn, AllocRequest::range(5, 4)),
        Err(AllocatorError::InvalidRequest(_))
    ));
    txn.commit().expect("commit");
}

#[test]
fn double_free_is_corruption() {
    let (_dev, journal, alloc) = direct(&[(10, 10)], AllocatorConfig::default(), 0);
    let run = allocate(&journal, &alloc, AllocRequest::exact(4));
    let mut txn = journal.begin().expect("begin");
    alloc.free(&mut txn, run).expect("free");
    let err = alloc.free(&mut txn, run).expect_err("double free");
    txn.commit().expect("commit");
    assert!(matches!(err, AllocatorError::Corruption { block: 10, .. }));
    assert!(hfs_error::HfsError::from(err).is_corruption());
    assert_eq!(alloc.free_blocks(), 10);
}

#[test]
fn free_outside_volume_is_rejected() {
    let (_dev, journal, alloc) = direct(&[(10, 10)], AllocatorConfig::default(), 0);
    let mut txn = journal.begin().expect("begin");
    let err = alloc.free(&mut txn, ext(TOTAL - 2, 4)).expect_err("range");
    txn.commit().expect("commit");
    assert!(matches!(err, AllocatorError::OutOfRange { .. }));
}

#[test]
fn bitmap_reaches_disk_in_direct_mode() {
    let (dev, journal, alloc) = direct(&[(8, 16)], AllocatorConfig::default(), 0);
    let run = allocate(&journal, &alloc, AllocRequest::exact(8));
    assert_eq!(run, ext(8, 8));
    let image = dev.snapshot();
    let at = (BITMAP_BLOCK * BS) as usize;
    assert_eq!(image[at + 1], 0xFF);
    assert_eq!(image[at + 2], 0x00);
    assert!(alloc.is_allocated(15).expect("bit"));
    assert!(!alloc.is_allocated(16).expect("bit"));
}

#[test]
fn freed_run_is_trimmed_after_durable_commit() {
    let (dev, journal, alloc) = logged(&[(100, 50)]);
    let run = allocate(&journal, &alloc, AllocRequest::exact(5).at(100));
    assert_eq!(run, ext(100, 5));
    let _ = dev.take_events();

    let mut txn = journal.begin().expect("begin");
    alloc.free(&mut txn, run).expect("free");
    assert!(
        !dev.take_events()
            .iter()
            .any(|e| matches!(e, DeviceEvent::Trim { .. })),
        "no trim before commit"
    );
    txn.commit().expect("commit");

    let events = dev.take_events();
    let trim = events
        .iter()
        .position(|e| *e == DeviceEvent::Trim { offset: 100 * 512, len: 5 * 512 })
        .expect("trim issued");
    let sync = events
        .iter()
        .position(|e| *e == DeviceEvent::Sync)
        .expect("commit synced");
    assert!(sync < trim);
}

#[test]
fn reallocating_freed_blocks_withdraws_trim() {
    let (dev, journal, alloc) = logged(&[(100, 50)]);
    let run = allocate(&journal, &alloc, AllocRequest::exact(5).at(100));
    let _ = dev.take_events();

    let mut txn = journal.begin().expect("begin");
    alloc.free(&mut txn, run).expect("free");
    assert_eq!(txn.pending_trims().len(), 1);
    let again = alloc
        .allocate(&mut txn, AllocRequest::exact(5).at(100))
        .expect("reallocate");
    assert_eq!(again, run);
    assert!(txn.pending_trims().is_empty());
    txn.commit().expect("commit");
    assert!(
        !dev.take_events()
            .iter()
            .any(|e| matches!(e, DeviceEvent::Trim { .. }))
    );
}

#[test]
fn mount_scan_trims_and_builds_summary() {
    let config = AllocatorConfig {
        summary_granularity_blocks: 64,
        ..AllocatorConfig::default()
    };
    let free = [(10, 10), (300, 40)];
    let (dev, _journal, alloc) = direct(&free, config, 0);
    let handle = alloc.start_scan(Cx::for_testing()).expect("start");
    let report = handle.join().expect("scan");
    assert_eq!(report.free_blocks, 50);
    assert_eq!(report.free_runs, 2);
    assert_eq!(report.trimmed_ranges, 2);
    assert_eq!(report.trimmed_blocks, 50);
    assert_eq!(report.full_groups, 13);
    assert!(!report.corrected_free_count);
    assert_eq!(alloc.full_groups(), Some(13));
    assert_eq!(alloc.cached_extents(), vec![ext(300, 40), ext(10, 10)]);
    let trims: Vec<DeviceEvent> = dev
        .take_events()
        .into_iter()
        .filter(|e| matches!(e, DeviceEvent::Trim { .. }))
        .collect();
    assert_eq!(
        trims,
        vec![
            DeviceEvent::Trim { offset: 10 * 512, len: 10 * 512 },
            DeviceEvent::Trim { offset: 300 * 512, len: 40 * 512 },
        ]
    );
}

#[test]
fn summary_table_skips_full_groups() {
    let config = AllocatorConfig {
        summary_granularity_blocks: 64,
        free_extent_cache_capacity: 0,
        ..AllocatorConfig::default()
    };
    let (_dev, journal, alloc) = direct(&[(10, 10), (300, 40)], config, 0);
    alloc.scan(&Cx::for_testing()).expect("scan");
    let run = allocate(&journal, &alloc, AllocRequest::exact(5).at(100));
    assert_eq!(run, ext(300, 5));
    assert!(alloc.stats().summary_skips >= 3);
}

#[test]
fn scan_corrects_recorded_free_count() {
    let dev = volume(&[(10, 10)]);
    let cache = BufferCache::new(Arc::new(dev), CacheConfig::default());
    let alloc = Allocator::new(cache, geometry(), AllocatorConfig::default(), 3, 0).expect("alloc");
    let report = alloc.scan(&Cx::for_testing()).expect("scan");
    assert!(report.corrected_free_count);
    assert_eq!(alloc.free_blocks(), 10);
}

#[test]
fn cancelled_scan_leaves_allocator_untouched() {
    let dev = volume(&[(10, 10)]);
    let cache = BufferCache::new(Arc::new(dev), CacheConfig::default());
    let alloc = Allocator::new(cache, geometry(), AllocatorConfig::default(), 3, 0).expect("alloc");
    let cx = Cx::for_testing();
    cx.set_cancel_requested(true);
    let err = alloc.scan(&cx).expect_err("cancelled");
    assert!(matches!(err, AllocatorError::Cancelled));
    assert!(matches!(
        hfs_error::HfsError::from(err),
        hfs_error::HfsError::Interrupted
    ));
    assert_eq!(alloc.free_blocks(), 3);
    assert!(alloc.cached_extents().is_empty());

    let report = alloc.scan(&Cx::for_testing()).expect("scan");
    assert_eq!(report.free_blocks, 10);
}

#[test]
fn unmount_hint_lowers_roving_pointer() {
    let (_dev, _journal, alloc) = direct(&[(10, 10), (300, 40)], AllocatorConfig::default(), 500);
    assert_eq!(alloc.unmount_hint(), 500);
    alloc.scan(&Cx::for_testing()).expect("scan");
    assert_eq!(alloc.unmount_hint(), 10);
    assert_eq!(alloc.next_allocation(), 10);
}

#[test]
fn geometry_must_cover_the_volume() {
    let dev = volume(&[]);
    let cache = BufferCache::new(Arc::new(dev), CacheConfig::default());
    let mut geo = geometry();
    geo.total_blocks = 8 * BS + 1;
    assert!(matches!(
        Allocator::new(cache, geo, AllocatorConfig::default(), 0, 0),
        Err(AllocatorError::Geometry(_))
    ));
}

#[derive(Debug, Clone)]
enum Op {
    Alloc { min: u32, max: u32, partial: bool },
    Free(Index),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1_u32..12, 0_u32..8, any::<bool>()).prop_map(|(min, extra, partial)| Op::Alloc {
            min,
            max: min + extra,
            partial,
        }),
        any::<Index>().prop_map(Op::Free),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Allocated blocks plus the free count always equal the blocks the
    /// volume started with, and the bitmap agrees with the counter.
    #[test]
    fn free_count_matches_bitmap(
        ops in proptest::collection::vec(op(), 1..80),
        holes in proptest::collection::vec((4_u32..1000, 1_u32..24), 0..6),
    ) {
        let free = [(4_u32, TOTAL - 4)];
        let (_dev, journal, alloc) = direct(&free, AllocatorConfig::default(), 0);
        // punch used holes so the search meets fragmented space
        let mut live: Vec<ExtentDescriptor> = Vec::new();
        {
            let mut txn = journal.begin().expect("begin");
            for &(start, count) in &holes {
                let count = count.min(TOTAL - start);
                if let Ok(run) = alloc.allocate(&mut txn, AllocRequest::range(1, count).at(start)) {
                    live.push(run);
                }
            }
            txn.commit().expect("commit");
        }

        for op in ops {
            let mut txn = journal.begin().expect("begin");
            match op {
                Op::Alloc { min, max, partial } => {
                    let mut request = AllocRequest::range(min, max);
                    if partial {
                        request = request.partial();
                    }
                    match alloc.allocate(&mut txn, request) {
                        Ok(run) => {
                            prop_assert!(run.block_count <= max);
                            prop_assert!(partial || run.block_count >= min);
                            live.push(run);
                        }
                        Err(err) => {
                            let no_space = matches!(err, AllocatorError::NoSpace { .. });
                            prop_assert!(no_space, "unexpected error {:?}", err);
                        }
                    }
                }
                Op::Free(index) => {
                    if !live.is_empty() {
                        let run = live.swap_remove(index.index(live.len()));
                        alloc.free(&mut txn, run).expect("free");
                    }
                }
            }
            txn.commit().expect("commit");

            let used: u32 = live.iter().map(|r| r.block_count).sum();
            prop_assert_eq!(alloc.free_blocks() + used + 4, TOTAL);
        }
        prop_assert_eq!(alloc.count_free().expect("count"), alloc.free_blocks());
        for run in &live {
            prop_assert!(alloc.is_allocated(run.start_block).expect("bit"));
        }
    }
}
