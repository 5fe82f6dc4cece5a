//! Small cache of known free runs.
//!
//! Entries are kept sorted largest first so the cache retains the runs most
//! likely to satisfy a request. Adjacent and overlapping runs are merged on
//! insert; allocating from any part of a cached run trims the entry.

use hfs_ondisk::ExtentDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeExtentCache {
    capacity: usize,
    extents: Vec<ExtentDescriptor>,
}

fn end(e: ExtentDescriptor) -> u64 {
    u64::from(e.start_block) + u64::from(e.block_count)
}

impl FreeExtentCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            extents: Vec::with_capacity(capacity),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Cached runs, largest first.
    #[must_use]
    pub fn extents(&self) -> &[ExtentDescriptor] {
        &self.extents
    }

    pub fn clear(&mut self) {
        self.extents.clear();
    }

    /// Offer a free run. Returns false when the cache is full of larger runs.
    pub fn insert(&mut self, extent: ExtentDescriptor) -> bool {
        if self.capacity == 0 || extent.is_empty() {
            return false;
        }
        let mut merged = extent;
        self.extents.retain(|e| {
            let touches =
                u64::from(e.start_block) <= end(merged) && u64::from(merged.start_block) <= end(*e);
            if touches {
                let start = e.start_block.min(merged.start_block);
                let stop = end(*e).max(end(merged));
                // both ends lie inside the volume
                let count = u32::try_from(stop - u64::from(start)).unwrap_or(u32::MAX);
                merged = ExtentDescriptor::new(start, count);
            }
            !touches
        });
        if self.extents.len() == self.capacity {
            let smallest = self.extents[self.extents.len() - 1];
            if smallest.block_count >= merged.block_count {
                return false;
            }
            let _ = self.extents.pop();
        }
        let at = self.extents.partition_point(|e| {
            (e.block_count, std::cmp::Reverse(e.start_block))
                >= (merged.block_count, std::cmp::Reverse(merged.start_block))
        });
        self.extents.insert(at, merged);
        true
    }

    /// Forget `[start, start + count)`, keeping the pieces of any cached run
    /// outside it.
    pub fn remove(&mut self, start: u32, count: u32) {
        let stop = u64::from(start) + u64::from(count);
        let mut pieces = Vec::new();
        self.extents.retain(|e| {
            let overlaps = u64::from(e.start_block) < stop && u64::from(start) < end(*e);
            if overlaps {
                if e.start_block < start {
                    pieces.push(ExtentDescriptor::new(e.start_block, start - e.start_block));
                }
                if end(*e) > stop {
                    let tail = u32::try_from(end(*e) - stop).unwrap_or(0);
                    let first = u32::try_from(stop).unwrap_or(u32::MAX);
                    pieces.push(ExtentDescriptor::new(first, tail));
                }
            }
            !overlaps
        });
        for piece in pieces {
            let _ = self.insert(piece);
        }
    }

    /// Lowest-starting cached run at or after `hint` holding `min` blocks.
    #[must_use]
    pub fn find(&self, hint: u32, min: u32) -> Option<ExtentDescriptor> {
        self.extents
            .iter()
            .filter(|e| e.start_block >= hint && e.block_count >= min)
            .min_by_key(|e| e.start_block)
            .copied()
    }

    #[must_use]
    pub fn largest(&self) -> Option<ExtentDescriptor> {
        self.extents.first().copied()
    }

    /// Smallest start block of any cached run.
    #[must_use]
    pub fn lowest_start(&self) -> Option<u32> {
        self.extents.iter().map(|e| e.start_block).min()
    }
}
