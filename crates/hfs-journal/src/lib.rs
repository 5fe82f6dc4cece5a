#![forbid(unsafe_code)]
//! Write-ahead metadata journal.
//!
//! Groups block modifications into atomic transactions. A transaction's
//! block list, payloads and checksummed commit block are written to a ring
//! inside the journal area and made durable before any block reaches its
//! home location; mount-time replay rewrites every committed transaction and
//! discards a trailing one without a valid commit.
//!
//! | Module | Role |
//! |--------|------|
//! | `format` | header, block list and commit encodings |
//! | `ring` | circular transaction area arithmetic and I/O |
//! | `journal` | transaction lifecycle, commit, checkpoint |
//! | `replay` | mount-time recovery |

mod format;
mod journal;
mod replay;
mod ring;

pub use format::{
    BLOCK_LIST_MAGIC, BlockInfo, BlockList, ByteOrder, COMMIT_MAGIC, CommitRecord,
    JOURNAL_ENDIAN_MARKER, JOURNAL_HEADER_LEN, JOURNAL_HEADER_MAGIC, JournalHeader, RecordError,
    encode_transaction, pad_to, transaction_len,
};
pub use journal::{
    CommitInfo, Journal, JournalConfig, JournalPhase, JournalStats, RingState, Transaction,
    TrimCallback,
};
pub use replay::ReplayReport;

use hfs_block::BlockCacheError;
use hfs_error::HfsError;
use hfs_types::FileId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JournalError {
    /// Committed transactions failed validation; the volume needs repair.
    #[error("journal corrupt at offset {offset}: {detail}")]
    Corrupt { offset: u64, detail: String },

    #[error("invalid journal geometry: {0}")]
    Geometry(String),

    #[error("transaction too large: {blocks} blocks")]
    TransactionTooLarge { blocks: usize },

    /// No room in the ring even with nothing left to checkpoint.
    #[error("journal full")]
    Full,

    #[error("block {file}:{block} ended without modify_start")]
    NotStarted { file: FileId, block: u64 },

    #[error("block {file}:{block} is already being modified")]
    AlreadyStarted { file: FileId, block: u64 },

    #[error("commit with {count} blocks still being modified")]
    StillModifying { count: usize },

    #[error("transaction already open on this thread")]
    Recursive,

    /// A transaction was abandoned or failed mid-commit.
    #[error("journal poisoned by an incomplete transaction")]
    Poisoned,

    #[error("journal closed")]
    Closed,

    #[error(transparent)]
    Cache(#[from] BlockCacheError),

    #[error("journal device error: {0}")]
    Device(#[from] HfsError),
}

impl From<JournalError> for HfsError {
    fn from(err: JournalError) -> Self {
        match err {
            JournalError::Corrupt { offset, detail } => Self::Corruption {
                block: offset,
                detail: format!("journal: {detail}"),
            },
            JournalError::Geometry(detail) => Self::InvalidGeometry(detail),
            JournalError::TransactionTooLarge { blocks } => Self::TransactionTooLarge { blocks },
            JournalError::Full => Self::JournalFull,
            JournalError::Closed => Self::ReadOnly,
            JournalError::Cache(err) => err.into(),
            JournalError::Device(err) => err,
            err @ (JournalError::NotStarted { .. }
            | JournalError::AlreadyStarted { .. }
            | JournalError::StillModifying { .. }
            | JournalError::Recursive
            | JournalError::Poisoned) => Self::InvariantViolation(err.to_string()),
        }
    }
}
