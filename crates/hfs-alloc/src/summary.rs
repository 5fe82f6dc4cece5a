//! Summary table over the allocation bitmap.
//!
//! One bit per group of `granularity` allocation blocks. A set bit means the
//! group is known to be completely allocated and searches skip it; a clear
//! bit only means "look at the bitmap". Bits are set by searches and the
//! mount scan when they cover a whole group without finding a free block,
//! and cleared whenever a block inside the group is freed.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryTable {
    granularity: u32,
    total_blocks: u32,
    words: Vec<u64>,
}

impl SummaryTable {
    /// A table with every group marked "may have free blocks".
    #[must_use]
    pub fn new(total_blocks: u32, granularity: u32) -> Self {
        let granularity = granularity.max(1);
        let groups = total_blocks.div_ceil(granularity) as usize;
        Self {
            granularity,
            total_blocks,
            words: vec![0; groups.div_ceil(64)],
        }
    }

    #[must_use]
    pub fn granularity(&self) -> u32 {
        self.granularity
    }

    #[must_use]
    pub fn groups(&self) -> u32 {
        self.total_blocks.div_ceil(self.granularity)
    }

    #[must_use]
    pub fn group_of(&self, block: u32) -> u32 {
        block / self.granularity
    }

    /// First block of `group`.
    #[must_use]
    pub fn group_start(&self, group: u32) -> u32 {
        group.saturating_mul(self.granularity)
    }

    /// One past the last block of `group`, clamped to the volume.
    #[must_use]
    pub fn group_end(&self, group: u32) -> u32 {
        group
            .saturating_add(1)
            .saturating_mul(self.granularity)
            .min(self.total_blocks)
    }

    #[must_use]
    pub fn is_full(&self, group: u32) -> bool {
        let group = group as usize;
        self.words
            .get(group / 64)
            .is_some_and(|w| w & (1 << (group % 64)) != 0)
    }

    pub fn mark_full(&mut self, group: u32) {
        let group = group as usize;
        if let Some(w) = self.words.get_mut(group / 64) {
            *w |= 1 << (group % 64);
        }
    }

    /// Clear the groups touched by `[start, start + count)`.
    pub fn mark_free(&mut self, start: u32, count: u32) {
        if count == 0 {
            return;
        }
        let last = start.saturating_add(count - 1);
        for group in self.group_of(start)..=self.group_of(last) {
            let group = group as usize;
            if let Some(w) = self.words.get_mut(group / 64) {
                *w &= !(1 << (group % 64));
            }
        }
    }

    #[must_use]
    pub fn full_groups(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_cover_the_volume() {
        let t = SummaryTable::new(100, 32);
        assert_eq!(t.groups(), 4);
        assert_eq!(t.group_of(95), 2);
        assert_eq!(t.group_start(3), 96);
        assert_eq!(t.group_end(3), 100);
        assert_eq!(t.group_end(1), 64);
    }

    #[test]
    fn free_clears_every_touched_group() {
        let mut t = SummaryTable::new(1000, 10);
        for g in 0..t.groups() {
            t.mark_full(g);
        }
        assert_eq!(t.full_groups(), 100);
        t.mark_free(19, 12);
        assert!(t.is_full(0));
        assert!(!t.is_full(1));
        assert!(!t.is_full(2));
        assert!(!t.is_full(3));
        assert!(t.is_full(4));
        assert_eq!(t.full_groups(), 97);
    }

    #[test]
    fn zero_granularity_is_clamped() {
        let t = SummaryTable::new(8, 0);
        assert_eq!(t.granularity(), 1);
        assert_eq!(t.groups(), 8);
        assert!(!t.is_full(7));
        assert!(!t.is_full(70));
    }
}
