#![forbid(unsafe_code)]
//! On-disk format parsing for HFS+ structures.
//!
//! Pure parsing crate with no I/O. Parses big-endian byte slices into typed
//! structures: volume header, HFS wrapper MDB, fork data and extent
//! descriptors, journal info block, B-tree node descriptor and header
//! record, and the keys and records of the catalog, extents and attributes
//! trees.

pub mod attributes;
pub mod btree;
pub mod catalog;
pub mod extents;
pub mod volume;

pub use attributes::{AttributeKey, AttributeRecord};
pub use btree::{
    BTreeAttributes, Endian, HeaderRecord, NodeDescriptor, NodeKind, HEADER_RECORD_SIZE,
    NODE_DESCRIPTOR_SIZE,
};
pub use catalog::{
    CatalogDates, CatalogKey, CatalogRecord, FileRecord, FolderRecord, ThreadRecord, UniName,
};
pub use extents::{ExtentKey, ExtentRecord};
pub use volume::{
    ExtentDescriptor, ExtentMap, ForkData, HeaderLocations, JournalInfoBlock, JournalInfoFlags,
    VolumeAttributes, VolumeHeader, WrapperMdb, EXTENT_DENSITY, JOURNAL_INFO_BLOCK_SIZE,
};
