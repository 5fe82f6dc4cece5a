#![forbid(unsafe_code)]
//! HFS+ volume layer.
//!
//! Ties the buffer cache, journal, allocator and B-trees into a mounted
//! volume: header discovery and maintenance, the mount state machine,
//! freeze and read-only transitions, statfs, and catalog operations.
//!
//! | Module | Role |
//! |--------|------|
//! | [`config`] | mount and format options |
//! | [`state`] | mount phase, writer gate, free-space thresholds |
//! | `header` | header location, validation, flush, alternates |
//! | `volume` | mount, sync, freeze, downgrade/upgrade, unmount |
//! | `forks` | special-file extents through the overflow tree |
//! | `catalog` | lookup, create and delete of files and folders |
//! | `format` | fresh-volume layout |
//!
//! ```text
//! Unmounted ─mount─▶ Mounting ─▶ Mounted ─freeze─▶ Freezing ─▶ Frozen
//!                                  ▲  │                          │
//!                                  │  └─unmount─▶ Unmounting     │
//!                                  └────── Thawing ◀───thaw──────┘
//! ```

pub mod config;
pub mod state;

mod catalog;
mod format;
mod forks;
mod header;
mod volume;

pub use catalog::CatalogEntry;
pub use config::{FormatOptions, MountOptions};
pub use format::format_volume;
pub use forks::{ForkKind, overflow_records, resolve_fork};
pub use header::FlushOptions;
pub use state::{
    FreeSpaceLevel, FreeSpaceThresholds, InconsistentReason, MountPhase, VolumeOp, VolumeState,
};
pub use volume::{
    JournalLocation, MountOutcome, NAME_MAX, SUBTYPE_CASE_SENSITIVE, SUBTYPE_JOURNALED, StatFs,
    Volume,
};

pub use asupersync::Cx;
pub use hfs_alloc::{AllocRequest, AllocatorConfig, ScanReport};
pub use hfs_block::{ByteDevice, CacheConfig, FileByteDevice, MemoryByteDevice};
pub use hfs_error::{HfsError, Result};
pub use hfs_journal::{JournalConfig, ReplayReport};
pub use hfs_ondisk::{CatalogRecord, ExtentDescriptor, VolumeAttributes, VolumeHeader};
pub use hfs_types::Cnid;

use hfs_types::ParseError;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the HFS epoch (1904-01-01) and the Unix epoch.
pub const HFS_EPOCH_OFFSET: u64 = 2_082_844_800;

pub(crate) fn parse_error(err: ParseError) -> HfsError {
    HfsError::Parse(err.to_string())
}

/// Current time in HFS epoch seconds, saturating at the end of the range.
#[must_use]
pub fn hfs_now() -> u32 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    u32::try_from(unix + HFS_EPOCH_OFFSET).unwrap_or(u32::MAX)
}
