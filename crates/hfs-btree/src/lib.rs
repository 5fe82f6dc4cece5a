#![forbid(unsafe_code)]
//! HFS+ B-tree engine.
//!
//! The catalog, extents-overflow and attributes files are all B+trees of
//! fixed-size nodes. This crate reads and writes those nodes through the
//! buffer cache and the journal, and keeps the header node (tree shape,
//! node counts, node-allocation map) consistent after every change.
//!
//! ## Node layout
//!
//! ```text
//! +------------+----------+----------+-----+------------+----------------+
//! | descriptor | record 0 | record 1 | ... | free space | offsets (back) |
//! +------------+----------+----------+-----+------------+----------------+
//!   14 bytes                                             2 * (n + 1) bytes
//! ```
//!
//! Record offsets are stored back to front from the end of the node; the
//! extra offset points at the start of free space. Index records are a key
//! followed by a 4-byte child node number, leaf records a key followed by
//! the payload.
//!
//! ## Modules
//!
//! | Module | Role |
//! |--------|------|
//! | [`swap`] | disk order to host order conversion with structural checks |
//! | [`compare`] | key comparators for each tree |
//! | `node` | record-level decode and encode of a host-order node |
//! | `tree` | control block, node checkout, search, walk, consistency check |
//! | `modify` | insert, delete, replace with split, merge and redistribution |
//! | `map` | header and map node free-node accounting |
//! | `extend` | file growth, tree formatting, attribute tree creation |

pub mod compare;
mod extend;
mod map;
mod modify;
mod node;
pub mod swap;
mod tree;

pub use compare::{AttributeKeys, BinaryKeys, CatalogKeys, ExtentKeys, KeyComparator};
pub use extend::{TreeParams, default_attribute_node_count};
pub use swap::{NodeSwapper, SwapDirection, SwapError};
pub use tree::{BTree, SearchResult, TreeCheck, TreeStats};

use hfs_alloc::AllocatorError;
use hfs_block::BlockCacheError;
use hfs_error::HfsError;
use hfs_journal::JournalError;
use hfs_types::{FileId, ParseError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BTreeError {
    /// A node failed structural validation: bad record offsets, a size
    /// mismatch, an unexpected node kind, or a loop in a node chain.
    #[error("b-tree {file} node {node} corrupt: {detail}")]
    Corruption {
        file: FileId,
        node: u32,
        detail: String,
    },

    #[error("record not found")]
    NotFound,

    #[error("record already exists")]
    Exists,

    /// Key length outside what the tree accepts.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Record cannot share a node with another record.
    #[error("record of {len} bytes exceeds node capacity {max}")]
    RecordTooLarge { len: usize, max: usize },

    /// The tree file could not grow by even one node.
    #[error("b-tree file cannot grow")]
    NoSpace,

    /// The extents file would need more than its eight inline extents.
    #[error("b-tree file {0} would need overflow extents")]
    ExtentsFull(FileId),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Alloc(#[from] AllocatorError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Cache(#[from] BlockCacheError),
}

impl BTreeError {
    pub(crate) fn corrupt(file: FileId, node: u32, detail: impl Into<String>) -> Self {
        Self::Corruption {
            file,
            node,
            detail: detail.into(),
        }
    }
}

impl From<BTreeError> for HfsError {
    fn from(err: BTreeError) -> Self {
        match err {
            BTreeError::Corruption { file, node, detail } => Self::Corruption {
                block: u64::from(node),
                detail: format!("b-tree {file}: {detail}"),
            },
            BTreeError::NotFound => Self::NotFound("b-tree record".into()),
            BTreeError::Exists => Self::Exists,
            BTreeError::InvalidKey(_) => Self::NameTooLong,
            BTreeError::RecordTooLarge { .. } => Self::InvariantViolation(err.to_string()),
            BTreeError::NoSpace | BTreeError::ExtentsFull(_) => Self::NoSpace,
            BTreeError::Parse(err) => Self::Parse(err.to_string()),
            BTreeError::Alloc(err) => err.into(),
            BTreeError::Journal(err) => err.into(),
            BTreeError::Cache(err) => err.into(),
        }
    }
}

pub(crate) type BTreeResult<T> = std::result::Result<T, BTreeError>;
