//! Roving first-fit allocator over the cached allocation bitmap.
//!
//! Search order for a request of `[min, max]` blocks:
//!
//! | Step | Source | Result |
//! |------|--------|--------|
//! | 1 | free-extent cache, lowest run at or after the hint | up to `max` blocks |
//! | 2 | bitmap from the hint to the end of the volume | first run of `min`, grown to `max` |
//! | 3 | bitmap from block 0 to just past the hint | same |
//! | 4 | largest run seen, if partial allocation is allowed | fewer than `min` blocks |
//!
//! Requests without a hint start at the roving pointer (`nextAllocation`)
//! and move it past the blocks they receive.

use crate::AllocatorError;
use crate::bitmap;
use crate::extent_cache::FreeExtentCache;
use crate::summary::SummaryTable;
use hfs_block::{BufKey, BufferCache, GetMode};
use hfs_journal::Transaction;
use hfs_ondisk::{ExtentDescriptor, ExtentMap};
use hfs_types::{ByteOffset, FileId};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, trace};

pub(crate) type AllocResult<T> = std::result::Result<T, AllocatorError>;

// ── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Free runs remembered between searches.
    ///
    /// Default: 10.
    pub free_extent_cache_capacity: usize,
    /// Allocation blocks summarized by one summary-table bit.
    ///
    /// Default: 32768 (one 4 KiB bitmap block).
    pub summary_granularity_blocks: u32,
    /// Trim every free run during the mount scan.
    ///
    /// Default: true.
    pub trim_on_mount: bool,
    /// Keep a summary table to skip full groups.
    ///
    /// Default: true.
    pub use_summary_table: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            free_extent_cache_capacity: 10,
            summary_granularity_blocks: 4096 * 8,
            trim_on_mount: true,
            use_summary_table: true,
        }
    }
}

// ── Requests ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocFlags {
    /// Accept the largest free run when none holds `min_blocks`.
    pub allow_partial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocRequest {
    /// First block to consider; `None` uses and advances the roving pointer.
    pub start_hint: Option<u32>,
    pub min_blocks: u32,
    pub max_blocks: u32,
    pub flags: AllocFlags,
}

impl AllocRequest {
    /// Exactly `count` contiguous blocks from the roving pointer.
    #[must_use]
    pub fn exact(count: u32) -> Self {
        Self::range(count, count)
    }

    #[must_use]
    pub fn range(min_blocks: u32, max_blocks: u32) -> Self {
        Self {
            start_hint: None,
            min_blocks,
            max_blocks,
            flags: AllocFlags::default(),
        }
    }

    #[must_use]
    pub fn at(mut self, block: u32) -> Self {
        self.start_hint = Some(block);
        self
    }

    #[must_use]
    pub fn partial(mut self) -> Self {
        self.flags.allow_partial = true;
        self
    }
}

// ── Geometry ───────────────────────────────────────────────────────────────

/// Where the volume and its bitmap live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocGeometry {
    pub total_blocks: u32,
    pub block_size: u32,
    /// Device offset of allocation block 0 (non-zero for embedded volumes).
    pub volume_offset: u64,
    /// Extents of the Allocation file.
    pub bitmap: ExtentMap,
}

impl AllocGeometry {
    #[must_use]
    pub fn block_offset(&self, block: u32) -> ByteOffset {
        ByteOffset(self.volume_offset + u64::from(block) * u64::from(self.block_size))
    }

    /// Allocation blocks described by one bitmap block.
    #[must_use]
    pub fn bits_per_bitmap_block(&self) -> u32 {
        self.block_size.saturating_mul(8)
    }

    /// Bitmap blocks needed to cover the volume.
    #[must_use]
    pub fn bitmap_blocks(&self) -> u32 {
        self.total_blocks.div_ceil(self.bits_per_bitmap_block())
    }

    fn validate(&self) -> AllocResult<()> {
        if self.total_blocks == 0 {
            return Err(AllocatorError::Geometry("volume has no blocks".into()));
        }
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(AllocatorError::Geometry(format!(
                "block size {} is not a power of two >= 512",
                self.block_size
            )));
        }
        let bits = self.bitmap.physical_len().saturating_mul(8);
        if bits < u64::from(self.total_blocks) {
            return Err(AllocatorError::Geometry(format!(
                "allocation file covers {bits} blocks, volume has {}",
                self.total_blocks
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocStats {
    pub allocations: u64,
    pub frees: u64,
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
    /// Requests satisfied from the free-extent cache.
    pub cache_hits: u64,
    pub bitmap_searches: u64,
    /// Full groups skipped through the summary table.
    pub summary_skips: u64,
    pub partial_allocations: u64,
}

// ── State ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct AllocState {
    pub(crate) free_blocks: u32,
    pub(crate) next_allocation: u32,
    pub(crate) summary: Option<SummaryTable>,
    pub(crate) extents: FreeExtentCache,
    pub(crate) stats: AllocStats,
}

#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) cache: BufferCache,
    pub(crate) geometry: AllocGeometry,
    pub(crate) config: AllocatorConfig,
    /// The bitmap lock.
    pub(crate) state: Mutex<AllocState>,
}

impl Inner {
    fn bitmap_location(&self, index: u32) -> AllocResult<(BufKey, ByteOffset, usize)> {
        let bs = u64::from(self.geometry.block_size);
        let file_offset = u64::from(index) * bs;
        let dev = self.geometry.bitmap.map_range(file_offset, bs).ok_or_else(|| {
            let block = index.saturating_mul(self.geometry.bits_per_bitmap_block());
            error!(target: "hfs::alloc", bitmap_block = index, "alloc_bitmap_unmapped");
            AllocatorError::Corruption {
                block,
                detail: format!("bitmap block {index} not mapped by the allocation file"),
            }
        })?;
        Ok((
            BufKey::new(FileId::ALLOCATION, u64::from(index)),
            ByteOffset(dev),
            self.geometry.block_size as usize,
        ))
    }

    /// Copy of bitmap block `index` as currently cached.
    pub(crate) fn read_bitmap_block(&self, index: u32) -> AllocResult<Vec<u8>> {
        let (key, dev, len) = self.bitmap_location(index)?;
        let guard = self.cache.get(key, dev, len, GetMode::Read)?;
        Ok(guard.to_vec())
    }
}

/// Handle to the allocation bitmap of one volume.
#[derive(Clone)]
pub struct Allocator {
    pub(crate) inner: Arc<Inner>,
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("Allocator")
            .field("total_blocks", &self.inner.geometry.total_blocks)
            .field("free_blocks", &st.free_blocks)
            .field("next_allocation", &st.next_allocation)
            .finish_non_exhaustive()
    }
}

impl Allocator {
    /// Attach to a bitmap whose header counters are `free_blocks` and
    /// `next_allocation`.
    pub fn new(
        cache: BufferCache,
        geometry: AllocGeometry,
        config: AllocatorConfig,
        free_blocks: u32,
        next_allocation: u32,
    ) -> AllocResult<Self> {
        geometry.validate()?;
        if free_blocks > geometry.total_blocks {
            error!(target: "hfs::alloc", free_blocks, total = geometry.total_blocks, "alloc_free_count_invalid");
            return Err(AllocatorError::Corruption {
                block: 0,
                detail: format!(
                    "free block count {free_blocks} exceeds total {}",
                    geometry.total_blocks
                ),
            });
        }
        let summary = config
            .use_summary_table
            .then(|| SummaryTable::new(geometry.total_blocks, config.summary_granularity_blocks));
        let next_allocation = if next_allocation >= geometry.total_blocks {
            0
        } else {
            next_allocation
        };
        debug!(
            target: "hfs::alloc",
            total = geometry.total_blocks,
            free_blocks,
            next_allocation,
            "alloc_attach"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                cache,
                state: Mutex::new(AllocState {
                    free_blocks,
                    next_allocation,
                    summary,
                    extents: FreeExtentCache::new(config.free_extent_cache_capacity),
                    stats: AllocStats::default(),
                }),
                geometry,
                config,
            }),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &AllocGeometry {
        &self.inner.geometry
    }

    #[must_use]
    pub fn config(&self) -> AllocatorConfig {
        self.inner.config
    }

    /// Take the bitmap lock for a sequence of operations.
    pub fn lock(&self) -> BitmapLock<'_> {
        BitmapLock {
            inner: &self.inner,
            state: self.inner.state.lock(),
        }
    }

    pub fn allocate(
        &self,
        txn: &mut Transaction<'_>,
        request: AllocRequest,
    ) -> AllocResult<ExtentDescriptor> {
        self.lock().allocate(txn, request)
    }

    pub fn free(&self, txn: &mut Transaction<'_>, extent: ExtentDescriptor) -> AllocResult<()> {
        self.lock().free(txn, extent)
    }

    pub fn mark_used(&self, txn: &mut Transaction<'_>, extent: ExtentDescriptor) -> AllocResult<()> {
        self.lock().mark_used(txn, extent)
    }

    pub fn is_allocated(&self, block: u32) -> AllocResult<bool> {
        self.lock().is_allocated(block)
    }

    #[must_use]
    pub fn free_blocks(&self) -> u32 {
        self.inner.state.lock().free_blocks
    }

    #[must_use]
    pub fn next_allocation(&self) -> u32 {
        self.inner.state.lock().next_allocation
    }

    pub fn set_next_allocation(&self, block: u32) {
        let mut st = self.inner.state.lock();
        st.next_allocation = if block >= self.inner.geometry.total_blocks {
            0
        } else {
            block
        };
    }

    #[must_use]
    pub fn stats(&self) -> AllocStats {
        self.inner.state.lock().stats
    }

    #[must_use]
    pub fn cached_extents(&self) -> Vec<ExtentDescriptor> {
        self.inner.state.lock().extents.extents().to_vec()
    }

    /// Groups currently marked full in the summary table.
    #[must_use]
    pub fn full_groups(&self) -> Option<u32> {
        self.inner
            .state
            .lock()
            .summary
            .as_ref()
            .map(SummaryTable::full_groups)
    }

    /// Lower the roving pointer to the lowest cached free run so the next
    /// mount starts allocating early in the volume. Returns the pointer.
    pub fn unmount_hint(&self) -> u32 {
        let mut st = self.inner.state.lock();
        if let Some(low) = st.extents.lowest_start() {
            if low < st.next_allocation {
                debug!(target: "hfs::alloc", from = st.next_allocation, to = low, "alloc_unmount_hint");
                st.next_allocation = low;
            }
        }
        st.next_allocation
    }

    /// Count clear bits by walking the whole bitmap.
    pub fn count_free(&self) -> AllocResult<u32> {
        let _st = self.inner.state.lock();
        let geo = &self.inner.geometry;
        let bits = geo.bits_per_bitmap_block();
        let mut free = 0_u32;
        for index in 0..geo.bitmap_blocks() {
            let bytes = self.inner.read_bitmap_block(index)?;
            let base = index * bits;
            let span = (geo.total_blocks - base).min(bits) as usize;
            let used = bitmap::count_set(&bytes, 0, span);
            free += u32::try_from(span - used).unwrap_or(0);
        }
        Ok(free)
    }
}

// ── Locked operations ──────────────────────────────────────────────────────

/// The bitmap lock held across one or more operations.
pub struct BitmapLock<'a> {
    inner: &'a Inner,
    state: MutexGuard<'a, AllocState>,
}

impl fmt::Debug for BitmapLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapLock")
            .field("free_blocks", &self.state.free_blocks)
            .finish_non_exhaustive()
    }
}

fn extent(start: u32, count: u32) -> ExtentDescriptor {
    ExtentDescriptor::new(start, count)
}

impl BitmapLock<'_> {
    #[must_use]
    pub fn free_blocks(&self) -> u32 {
        self.state.free_blocks
    }

    pub fn is_allocated(&self, block: u32) -> AllocResult<bool> {
        let total = self.inner.geometry.total_blocks;
        if block >= total {
            return Err(AllocatorError::OutOfRange {
                start: block,
                count: 1,
                total,
            });
        }
        let bits = self.inner.geometry.bits_per_bitmap_block();
        let bytes = self.inner.read_bitmap_block(block / bits)?;
        Ok(bitmap::bit_is_set(&bytes, (block % bits) as usize))
    }

    /// Allocate a run of `[min_blocks, max_blocks]` blocks, or fewer when
    /// the request allows a partial result.
    ///
    /// The result is the first run of at least `min_blocks` free blocks at
    /// or after the hint (the roving pointer unless the request names a
    /// block), wrapping to block 0 when none exists above it. The free
    /// extent cache never overrides that order: its lowest fitting run at
    /// or after the hint only bounds how far the first bitmap pass reads.
    pub fn allocate(
        &mut self,
        txn: &mut Transaction<'_>,
        request: AllocRequest,
    ) -> AllocResult<ExtentDescriptor> {
        let total = self.inner.geometry.total_blocks;
        if request.min_blocks == 0 || request.min_blocks > request.max_blocks {
            error!(target: "hfs::alloc", invariant = "valid_request", min = request.min_blocks, max = request.max_blocks, "alloc_invariant_violation");
            return Err(AllocatorError::InvalidRequest(format!(
                "min {} max {}",
                request.min_blocks, request.max_blocks
            )));
        }
        let min = request.min_blocks;
        let max = request.max_blocks.min(total);
        if self.state.free_blocks == 0 {
            debug!(target: "hfs::alloc", requested = min, "alloc_volume_full");
            return Err(AllocatorError::NoSpace { requested: min });
        }
        let hint = match request.start_hint.unwrap_or(self.state.next_allocation) {
            h if h >= total => 0,
            h => h,
        };

        let mut best: Option<ExtentDescriptor> = None;
        let cached = self.state.extents.find(hint, min);
        let first_end = cached.map_or(total, |c| c.start_block.saturating_add(max).min(total));
        let mut found = self.search(hint, first_end, min, max, &mut best)?;
        match (cached, found) {
            (Some(c), Some(run)) if run.start_block == c.start_block => {
                self.state.stats.cache_hits += 1;
            }
            (Some(_), None) if first_end < total => {
                // stale cache entry: the bitmap has the final say
                found = self.search(hint, total, min, max, &mut best)?;
            }
            _ => {}
        }
        if found.is_none() && hint > 0 {
            // overlap the first pass so a run straddling the hint is seen whole
            let wrap_end = hint.saturating_add(max).min(total);
            found = self.search(0, wrap_end, min, max, &mut best)?;
        }
        if found.is_none() && request.flags.allow_partial {
            if let Some(largest) = self.state.extents.largest() {
                if best.is_none_or(|b| largest.block_count > b.block_count) {
                    best = Some(largest);
                }
            }
            if let Some(run) = best.map(|b| extent(b.start_block, b.block_count.min(max))) {
                self.state.stats.partial_allocations += 1;
                debug!(target: "hfs::alloc", requested = min, got = run.block_count, start = run.start_block, "alloc_partial");
                found = Some(run);
            }
        }
        let Some(run) = found else {
            debug!(target: "hfs::alloc", requested = min, free = self.state.free_blocks, "alloc_no_space");
            return Err(AllocatorError::NoSpace { requested: min });
        };

        self.update_bits(txn, run.start_block, run.block_count, true)?;
        self.state.free_blocks = self.state.free_blocks.saturating_sub(run.block_count);
        self.state.extents.remove(run.start_block, run.block_count);
        let geo = &self.inner.geometry;
        txn.cancel_trim(
            geo.block_offset(run.start_block),
            u64::from(run.block_count) * u64::from(geo.block_size),
        );
        if request.start_hint.is_none() {
            let next = run.end_block();
            self.state.next_allocation = if next >= total { 0 } else { next };
        }
        self.state.stats.allocations += 1;
        self.state.stats.blocks_allocated += u64::from(run.block_count);
        trace!(
            target: "hfs::alloc",
            start = run.start_block,
            count = run.block_count,
            hint,
            free = self.state.free_blocks,
            "alloc_blocks"
        );
        Ok(run)
    }

    /// Return a run to the free pool. The range is trimmed once `txn` is
    /// durable.
    pub fn free(&mut self, txn: &mut Transaction<'_>, run: ExtentDescriptor) -> AllocResult<()> {
        if run.is_empty() {
            return Ok(());
        }
        self.check_range(run)?;
        self.update_bits(txn, run.start_block, run.block_count, false)?;
        let total = self.inner.geometry.total_blocks;
        self.state.free_blocks = self
            .state
            .free_blocks
            .saturating_add(run.block_count)
            .min(total);
        if let Some(summary) = self.state.summary.as_mut() {
            summary.mark_free(run.start_block, run.block_count);
        }
        let _ = self.state.extents.insert(run);
        let geo = &self.inner.geometry;
        txn.add_trim(
            geo.block_offset(run.start_block),
            u64::from(run.block_count) * u64::from(geo.block_size),
        );
        self.state.stats.frees += 1;
        self.state.stats.blocks_freed += u64::from(run.block_count);
        trace!(
            target: "hfs::alloc",
            start = run.start_block,
            count = run.block_count,
            free = self.state.free_blocks,
            "alloc_free_blocks"
        );
        Ok(())
    }

    /// Mark a specific free run as in use (fixed-location metadata).
    pub fn mark_used(&mut self, txn: &mut Transaction<'_>, run: ExtentDescriptor) -> AllocResult<()> {
        if run.is_empty() {
            return Ok(());
        }
        self.check_range(run)?;
        self.update_bits(txn, run.start_block, run.block_count, true)?;
        self.state.free_blocks = self.state.free_blocks.saturating_sub(run.block_count);
        self.state.extents.remove(run.start_block, run.block_count);
        let geo = &self.inner.geometry;
        txn.cancel_trim(
            geo.block_offset(run.start_block),
            u64::from(run.block_count) * u64::from(geo.block_size),
        );
        self.state.stats.blocks_allocated += u64::from(run.block_count);
        Ok(())
    }

    fn check_range(&self, run: ExtentDescriptor) -> AllocResult<()> {
        let total = self.inner.geometry.total_blocks;
        if u64::from(run.start_block) + u64::from(run.block_count) > u64::from(total) {
            error!(target: "hfs::alloc", start = run.start_block, count = run.block_count, total, "alloc_extent_out_of_range");
            return Err(AllocatorError::OutOfRange {
                start: run.start_block,
                count: run.block_count,
                total,
            });
        }
        Ok(())
    }

    /// Record a free run the search stepped over.
    fn note_run(&mut self, start: u32, len: u32, best: &mut Option<ExtentDescriptor>) {
        if len == 0 {
            return;
        }
        let run = extent(start, len);
        if best.is_none_or(|b| len > b.block_count) {
            *best = Some(run);
        }
        let _ = self.state.extents.insert(run);
    }

    /// First-fit search of `[from, to)`.
    fn search(
        &mut self,
        from: u32,
        to: u32,
        min: u32,
        max: u32,
        best: &mut Option<ExtentDescriptor>,
    ) -> AllocResult<Option<ExtentDescriptor>> {
        self.state.stats.bitmap_searches += 1;
        let bits = self.inner.geometry.bits_per_bitmap_block();
        let mut loaded: Option<(u32, Vec<u8>)> = None;
        // (group, entered at its first block and no free bit seen yet)
        let mut group_cursor: Option<(u32, bool)> = None;
        let mut run_start = from;
        let mut run_len = 0_u32;
        let mut block = from;

        while block < to {
            let (group, group_start, group_end) = match self.state.summary.as_ref() {
                Some(s) => {
                    let g = s.group_of(block);
                    (Some(g), s.group_start(g), s.group_end(g))
                }
                None => (None, 0, u32::MAX),
            };
            if let Some(g) = group {
                if self.state.summary.as_ref().is_some_and(|s| s.is_full(g)) {
                    if run_len >= min {
                        return Ok(Some(extent(run_start, run_len)));
                    }
                    self.note_run(run_start, run_len, best);
                    run_len = 0;
                    self.state.stats.summary_skips += 1;
                    block = group_end.min(to);
                    continue;
                }
                if group_cursor.is_none_or(|(cur, _)| cur != g) {
                    group_cursor = Some((g, block == group_start));
                }
            }

            let index = block / bits;
            let base = index * bits;
            let seg_end = to.min(group_end).min(base.saturating_add(bits));
            if loaded.as_ref().is_none_or(|(i, _)| *i != index) {
                loaded = Some((index, self.inner.read_bitmap_block(index)?));
            }
            let Some((_, bytes)) = loaded.as_ref() else {
                break;
            };

            let mut saw_free = false;
            let mut b = block;
            while b < seg_end {
                let rel = (b - base) as usize;
                let byte = bytes.get(rel / 8).copied().unwrap_or(0xFF);
                if rel % 8 == 0 && seg_end - b >= 8 && (byte == 0xFF || byte == 0) {
                    if byte == 0xFF {
                        if run_len >= min {
                            return Ok(Some(extent(run_start, run_len)));
                        }
                        if run_len > 0 {
                            let (s, l) = (run_start, run_len);
                            self.note_run(s, l, best);
                        }
                        run_len = 0;
                    } else {
                        saw_free = true;
                        if run_len == 0 {
                            run_start = b;
                        }
                        run_len += 8.min(max - run_len);
                        if run_len == max {
                            return Ok(Some(extent(run_start, run_len)));
                        }
                    }
                    b += 8;
                    continue;
                }
                if byte & bitmap::bit_mask(rel) != 0 {
                    if run_len >= min {
                        return Ok(Some(extent(run_start, run_len)));
                    }
                    if run_len > 0 {
                        let (s, l) = (run_start, run_len);
                        self.note_run(s, l, best);
                    }
                    run_len = 0;
                } else {
                    saw_free = true;
                    if run_len == 0 {
                        run_start = b;
                    }
                    run_len += 1;
                    if run_len == max {
                        return Ok(Some(extent(run_start, run_len)));
                    }
                }
                b += 1;
            }

            if let Some((g, clean)) = group_cursor.as_mut() {
                *clean &= !saw_free;
                if seg_end == group_end && *clean {
                    let g = *g;
                    if let Some(s) = self.state.summary.as_mut() {
                        s.mark_full(g);
                    }
                    trace!(target: "hfs::alloc", group = g, "alloc_summary_mark_full");
                }
            }
            block = seg_end;
        }

        if run_len >= min {
            return Ok(Some(extent(run_start, run_len)));
        }
        self.note_run(run_start, run_len, best);
        Ok(None)
    }

    /// Set or clear `[start, start + count)` inside `txn`, failing before
    /// any change if a bit already has the target value.
    fn update_bits(
        &mut self,
        txn: &mut Transaction<'_>,
        start: u32,
        count: u32,
        set: bool,
    ) -> AllocResult<()> {
        let bits = self.inner.geometry.bits_per_bitmap_block();
        let end = start + count;

        let mut block = start;
        while block < end {
            let index = block / bits;
            let base = index * bits;
            let seg_end = end.min(base.saturating_add(bits));
            let bytes = self.inner.read_bitmap_block(index)?;
            let rel = (block - base) as usize;
            let len = (seg_end - block) as usize;
            if !bitmap::all_bits(&bytes, rel, len, !set) {
                let bad = (rel..rel + len)
                    .find(|&i| bitmap::bit_is_set(&bytes, i) == set)
                    .unwrap_or(rel);
                let bad_block = base + u32::try_from(bad).unwrap_or(0);
                let detail = if set {
                    "block already allocated"
                } else {
                    "double free: block already free"
                };
                error!(target: "hfs::alloc", block = bad_block, start, count, detail, "alloc_bitmap_mismatch");
                return Err(AllocatorError::Corruption {
                    block: bad_block,
                    detail: detail.into(),
                });
            }
            block = seg_end;
        }

        let mut block = start;
        while block < end {
            let index = block / bits;
            let base = index * bits;
            let seg_end = end.min(base.saturating_add(bits));
            let (key, dev, len) = self.inner.bitmap_location(index)?;
            let mut guard = self.inner.cache.get(key, dev, len, GetMode::Read)?;
            txn.modify_start(&guard)?;
            let rel = (block - base) as usize;
            let n = (seg_end - block) as usize;
            if set {
                bitmap::set_bits(&mut guard, rel, n);
            } else {
                bitmap::clear_bits(&mut guard, rel, n);
            }
            txn.modify_end(guard, None)?;
            block = seg_end;
        }
        Ok(())
    }
}
