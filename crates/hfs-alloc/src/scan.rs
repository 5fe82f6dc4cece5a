//! Mount-time scan of the allocation bitmap.
//!
//! A single pass over the bitmap that trims every free run (when enabled),
//! rebuilds the summary table, seeds the free-extent cache and recounts free
//! blocks. The scan holds the bitmap lock for its whole duration, so
//! allocations made while it runs wait for it. [`Allocator::start_scan`]
//! returns as soon as the scan thread owns the lock.
//!
//! The scan checks its `Cx` before each bitmap block read. A cancelled scan
//! changes nothing: the cache, summary and free count are only replaced
//! once every block has been read.

use crate::allocator::{AllocResult, AllocState, Allocator, Inner};
use crate::summary::SummaryTable;
use crate::{AllocatorError, bitmap};
use asupersync::Cx;
use hfs_ondisk::ExtentDescriptor;
use hfs_types::ByteOffset;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub free_blocks: u32,
    pub free_runs: u64,
    pub trimmed_ranges: usize,
    pub trimmed_blocks: u64,
    pub full_groups: u32,
    /// The header's free count disagreed with the bitmap and was replaced.
    pub corrected_free_count: bool,
}

/// Background scan started by [`Allocator::start_scan`].
#[derive(Debug)]
pub struct ScanHandle {
    thread: JoinHandle<AllocResult<ScanReport>>,
}

impl ScanHandle {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the scan to complete.
    pub fn join(self) -> AllocResult<ScanReport> {
        self.thread
            .join()
            .map_err(|_| AllocatorError::ScanPanicked)?
    }
}

impl Allocator {
    /// Start the scan on its own thread and return once it holds the bitmap
    /// lock.
    pub fn start_scan(&self, cx: Cx) -> AllocResult<ScanHandle> {
        let inner = Arc::clone(&self.inner);
        let started = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&started);
        let thread = thread::Builder::new()
            .name("hfs-alloc-scan".into())
            .spawn(move || {
                let state = inner.state.lock();
                let (flag, cv) = &*signal;
                *flag.lock() = true;
                cv.notify_all();
                scan_locked(&cx, &inner, state)
            })
            .map_err(AllocatorError::Spawn)?;

        let (flag, cv) = &*started;
        let mut held = flag.lock();
        while !*held {
            cv.wait(&mut held);
        }
        drop(held);
        debug!(target: "hfs::alloc", "alloc_scan_started");
        Ok(ScanHandle { thread })
    }

    /// Run the scan on the calling thread.
    pub fn scan(&self, cx: &Cx) -> AllocResult<ScanReport> {
        scan_locked(cx, &self.inner, self.inner.state.lock())
    }
}

fn scan_locked(
    cx: &Cx,
    inner: &Inner,
    mut state: MutexGuard<'_, AllocState>,
) -> AllocResult<ScanReport> {
    let geo = &inner.geometry;
    let total = geo.total_blocks;
    let bits = geo.bits_per_bitmap_block();
    let mut summary = inner
        .config
        .use_summary_table
        .then(|| SummaryTable::new(total, inner.config.summary_granularity_blocks));
    let mut group_has_free = vec![false; summary.as_ref().map_or(0, |s| s.groups() as usize)];
    let mut runs: Vec<ExtentDescriptor> = Vec::new();
    let mut free = 0_u32;
    let mut run_start = 0_u32;
    let mut run_len = 0_u32;

    for index in 0..geo.bitmap_blocks() {
        if cx.checkpoint().is_err() {
            info!(target: "hfs::alloc", bitmap_block = index, "alloc_scan_cancelled");
            return Err(AllocatorError::Cancelled);
        }
        let bytes = inner.read_bitmap_block(index)?;
        let base = index * bits;
        let span_end = base + (total - base).min(bits);
        let mut b = base;
        while b < span_end {
            let rel = (b - base) as usize;
            let byte = bytes.get(rel / 8).copied().unwrap_or(0xFF);
            let step = if rel % 8 == 0 && span_end - b >= 8 && (byte == 0 || byte == 0xFF) {
                8
            } else {
                1
            };
            let is_free = if step == 8 {
                byte == 0
            } else {
                byte & bitmap::bit_mask(rel) == 0
            };
            if is_free {
                if run_len == 0 {
                    run_start = b;
                }
                run_len += step;
                free += step;
                if let Some(s) = summary.as_ref() {
                    for blk in [b, b + step - 1] {
                        if let Some(slot) = group_has_free.get_mut(s.group_of(blk) as usize) {
                            *slot = true;
                        }
                    }
                }
            } else if run_len > 0 {
                runs.push(ExtentDescriptor::new(run_start, run_len));
                run_len = 0;
            }
            b += step;
        }
    }
    if run_len > 0 {
        runs.push(ExtentDescriptor::new(run_start, run_len));
    }

    if let Some(s) = summary.as_mut() {
        for (group, has_free) in (0_u32..).zip(&group_has_free) {
            if !has_free {
                s.mark_full(group);
            }
        }
    }

    let mut report = ScanReport {
        free_blocks: free,
        free_runs: runs.len() as u64,
        full_groups: summary.as_ref().map_or(0, SummaryTable::full_groups),
        ..ScanReport::default()
    };

    let device = inner.cache.device();
    if inner.config.trim_on_mount && device.is_writable() && !runs.is_empty() {
        let bs = u64::from(geo.block_size);
        let ranges: Vec<(ByteOffset, u64)> = runs
            .iter()
            .map(|r| (geo.block_offset(r.start_block), u64::from(r.block_count) * bs))
            .collect();
        match device.trim(&ranges) {
            Ok(()) => {
                report.trimmed_ranges = ranges.len();
                report.trimmed_blocks = runs.iter().map(|r| u64::from(r.block_count)).sum();
            }
            Err(err) => {
                warn!(target: "hfs::alloc", %err, ranges = ranges.len(), "alloc_scan_trim_failed");
            }
        }
    }

    state.extents.clear();
    for run in &runs {
        let _ = state.extents.insert(*run);
    }
    if free != state.free_blocks {
        warn!(
            target: "hfs::alloc",
            recorded = state.free_blocks,
            counted = free,
            "alloc_free_count_mismatch"
        );
        state.free_blocks = free;
        report.corrected_free_count = true;
    }
    state.summary = summary;
    drop(state);

    info!(
        target: "hfs::alloc",
        free_blocks = report.free_blocks,
        free_runs = report.free_runs,
        trimmed_ranges = report.trimmed_ranges,
        full_groups = report.full_groups,
        "alloc_scan_complete"
    );
    Ok(report)
}
