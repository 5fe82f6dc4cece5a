#![forbid(unsafe_code)]
//! HFS+ filesystem core.
//!
//! Re-exports the volume layer from `hfs-core` as the stable external
//! interface: mount a [`ByteDevice`], then use [`Volume`] for catalog
//! operations, sync, freeze and unmount.

pub use hfs_core::*;
