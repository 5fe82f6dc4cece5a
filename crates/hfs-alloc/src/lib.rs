#![forbid(unsafe_code)]
//! Allocation-block management.
//!
//! The free-space bitmap lives in the Allocation file and is read and
//! modified through the buffer cache, so every change is part of the
//! caller's journal transaction.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap** ([`bitmap`]): MSB-first bit manipulation on byte slices.
//! 2. **Summary table** ([`SummaryTable`]): one bit per block group marking
//!    groups known to be full, so searches skip them.
//! 3. **Free-extent cache** ([`FreeExtentCache`]): the largest free runs
//!    seen recently, consulted before any bitmap scan.
//! 4. **Allocator** ([`Allocator`]): roving first-fit search with
//!    wrap-around and a partial fallback, frees with double-free detection,
//!    trims queued on the transaction.
//! 5. **Mount scan** ([`ScanHandle`]): one background pass that trims free
//!    space and fills the summary table while holding the bitmap lock.

pub mod bitmap;
mod allocator;
mod extent_cache;
mod scan;
mod summary;

pub use allocator::{
    AllocFlags, AllocGeometry, AllocRequest, AllocStats, Allocator, AllocatorConfig, BitmapLock,
};
pub use extent_cache::FreeExtentCache;
pub use scan::{ScanHandle, ScanReport};
pub use summary::SummaryTable;

use hfs_block::BlockCacheError;
use hfs_error::HfsError;
use hfs_journal::JournalError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocatorError {
    /// No run of any permitted size is free.
    #[error("no free run for {requested} blocks")]
    NoSpace { requested: u32 },

    /// Bitmap contents disagree with the operation (double free, block
    /// already in use, bitmap block unmapped).
    #[error("allocation bitmap corrupt at block {block}: {detail}")]
    Corruption { block: u32, detail: String },

    #[error("extent [{start}, +{count}) outside volume of {total} blocks")]
    OutOfRange { start: u32, count: u32, total: u32 },

    #[error("invalid allocation request: {0}")]
    InvalidRequest(String),

    #[error("invalid allocator geometry: {0}")]
    Geometry(String),

    #[error("mount scan thread could not start: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("mount scan thread panicked")]
    ScanPanicked,

    /// The scan's context was cancelled or ran out of budget.
    #[error("mount scan cancelled")]
    Cancelled,

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Cache(#[from] BlockCacheError),
}

impl From<AllocatorError> for HfsError {
    fn from(err: AllocatorError) -> Self {
        match err {
            AllocatorError::NoSpace { .. } => Self::NoSpace,
            AllocatorError::Corruption { block, detail } => Self::Corruption {
                block: u64::from(block),
                detail: format!("allocation bitmap: {detail}"),
            },
            AllocatorError::OutOfRange { start, count, total } => Self::Corruption {
                block: u64::from(start),
                detail: format!("extent of {count} blocks past volume end {total}"),
            },
            AllocatorError::Geometry(detail) => Self::InvalidGeometry(detail),
            AllocatorError::Spawn(err) => Self::Io(err),
            AllocatorError::Cancelled => Self::Interrupted,
            err @ (AllocatorError::InvalidRequest(_) | AllocatorError::ScanPanicked) => {
                Self::InvariantViolation(err.to_string())
            }
            AllocatorError::Journal(err) => err.into(),
            AllocatorError::Cache(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_keeps_error_classes() {
        assert!(HfsError::from(AllocatorError::NoSpace { requested: 4 }).is_exhaustion());
        let double_free = HfsError::from(AllocatorError::Corruption {
            block: 9,
            detail: "double free".into(),
        });
        assert!(double_free.is_corruption());
        assert!(
            HfsError::from(AllocatorError::OutOfRange {
                start: 10,
                count: 5,
                total: 12
            })
            .is_corruption()
        );
        assert!(
            HfsError::from(AllocatorError::InvalidRequest("min 0".into())).is_invariant_violation()
        );
        assert!(HfsError::from(AllocatorError::Journal(JournalError::Full)).is_exhaustion());
    }
}
