#![forbid(unsafe_code)]
//! Error types for the HFS+ core.
//!
//! # Error Taxonomy
//!
//! Every subsystem owns a closed error enum and converts into [`HfsError`] at
//! its crate boundary:
//!
//! | Layer | Type | Crate |
//! |-------|------|-------|
//! | Parsing | `ParseError` | `hfs-types` |
//! | Buffer cache | `BlockCacheError` | `hfs-block` |
//! | Journal | `JournalError` | `hfs-journal` |
//! | Allocator | `AllocatorError` | `hfs-alloc` |
//! | B-tree | `BTreeError` | `hfs-btree` |
//! | User-facing | `HfsError` | `hfs-error` (this crate) |
//!
//! `hfs-error` depends on no workspace crate, so the `From` impls live next
//! to the subsystem enums.
//!
//! The four error classes stay distinguishable after conversion:
//!
//! | Class | Variants | Volume reaction |
//! |-------|----------|-----------------|
//! | I/O | `Io` | propagate, volume stays consistent |
//! | Corruption | `Corruption`, `Format`, `Parse` | mark volume inconsistent |
//! | Exhaustion | `NoSpace`, `JournalFull`, `TransactionTooLarge`, `DirtyLimit` | propagate to caller |
//! | Invariant | `InvariantViolation` | force read-only, refuse further transactions |
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format`, `Parse`, `InvalidGeometry`, `InvalidArgument`, `Inconsistent` | `EINVAL` |
//! | `UnsupportedFeature` | `EOPNOTSUPP` |
//! | `NoSpace`, `JournalFull` | `ENOSPC` |
//! | `TransactionTooLarge` | `EFBIG` |
//! | `DirtyLimit` | `EAGAIN` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `ReadOnly` | `EROFS` |
//! | `Busy` | `EBUSY` |
//! | `Interrupted` | `EINTR` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `NotEmpty` | `ENOTEMPTY` |
//! | `InvariantViolation` | `EIO` |

use thiserror::Error;

/// Unified error type for all volume operations.
#[derive(Debug, Error)]
pub enum HfsError {
    /// Operating system I/O error from the byte device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known block or node.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Not an HFS+ volume, or a header field is structurally invalid.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without block context.
    #[error("parse error: {0}")]
    Parse(String),

    /// The volume uses a feature this build does not implement.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Block size, node size or volume size out of range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// No run of free allocation blocks satisfies the request.
    #[error("no space left on device")]
    NoSpace,

    /// The journal ring has no room even after checkpointing.
    #[error("journal full")]
    JournalFull,

    /// A single transaction touches more blocks than the journal can hold.
    #[error("transaction too large: {blocks} blocks")]
    TransactionTooLarge { blocks: usize },

    /// Deferred dirty buffers exceed the configured bound and the forced
    /// flush could not make room.
    #[error("dirty buffer limit reached ({limit})")]
    DirtyLimit { limit: usize },

    /// Caller error: empty name, thaw of a volume that is not frozen.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file exists")]
    Exists,

    /// Volume is mounted read-only and a write was attempted.
    #[error("read-only filesystem")]
    ReadOnly,

    /// The volume carries the persistent inconsistent bit and the request
    /// needs a consistent volume (read-write mount, upgrade).
    #[error("volume is marked inconsistent; run a consistency check")]
    Inconsistent,

    /// Another exclusive operation (freeze, tree creation) is in progress.
    #[error("resource busy")]
    Busy,

    /// A blocking wait was interrupted before it completed.
    #[error("operation interrupted")]
    Interrupted,

    #[error("name too long")]
    NameTooLong,

    #[error("directory not empty")]
    NotEmpty,

    /// Programming invariant violated (unpinned release, commit with a block
    /// still checked out). The volume refuses further writes afterwards.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl HfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; adding a variant is a compile error until
    /// its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::InvariantViolation(_) => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidGeometry(_)
            | Self::InvalidArgument(_)
            | Self::Inconsistent => libc::EINVAL,
            Self::UnsupportedFeature(_) => libc::EOPNOTSUPP,
            Self::NoSpace | Self::JournalFull => libc::ENOSPC,
            Self::TransactionTooLarge { .. } => libc::EFBIG,
            Self::DirtyLimit { .. } => libc::EAGAIN,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::ReadOnly => libc::EROFS,
            Self::Busy => libc::EBUSY,
            Self::Interrupted => libc::EINTR,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::NotEmpty => libc::ENOTEMPTY,
        }
    }

    /// True when the error indicates on-disk structural damage and the
    /// volume should be marked inconsistent.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::Parse(_))
    }

    /// True for resource exhaustion that a caller may retry after freeing
    /// space or flushing.
    #[must_use]
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::NoSpace
                | Self::JournalFull
                | Self::TransactionTooLarge { .. }
                | Self::DirtyLimit { .. }
        )
    }

    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

/// Result alias using `HfsError`.
pub type Result<T> = std::result::Result<T, HfsError>;
