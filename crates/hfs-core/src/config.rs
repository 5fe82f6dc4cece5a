//! Mount and format options.

use hfs_alloc::AllocatorConfig;
use hfs_block::CacheConfig;
use hfs_journal::JournalConfig;
use serde::{Deserialize, Serialize};

// ── Mount ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    /// Mount without writing anything to the volume.
    ///
    /// Default: false.
    pub read_only: bool,
    /// Ignore the journal. A read-write mount of a journaled volume clears
    /// its journaled attribute.
    ///
    /// Default: false.
    pub journal_disable: bool,
    /// Replay the journal and stop; see [`crate::Volume::open`].
    ///
    /// Default: false.
    pub journal_replay_only: bool,
    /// Permit a read-write mount of a volume flagged inconsistent.
    ///
    /// Default: false.
    pub allow_inconsistent_rw: bool,
    /// Start the background bitmap scan after a read-write mount.
    ///
    /// Default: true.
    pub run_mount_scan: bool,
    pub cache: CacheConfig,
    pub journal: JournalConfig,
    pub allocator: AllocatorConfig,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            journal_disable: false,
            journal_replay_only: false,
            allow_inconsistent_rw: false,
            run_mount_scan: true,
            cache: CacheConfig::default(),
            journal: JournalConfig::default(),
            allocator: AllocatorConfig::default(),
        }
    }
}

impl MountOptions {
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }
}

// ── Format ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    /// Allocation block size, a power of two of at least 512.
    ///
    /// Default: 4096.
    pub block_size: u32,
    /// Volume size in allocation blocks; `None` fills the device.
    pub total_blocks: Option<u32>,
    /// Default: 8192.
    pub catalog_node_size: u16,
    /// Default: 4096.
    pub extents_node_size: u16,
    /// Initial nodes of each B-tree file, header and map nodes included.
    ///
    /// Default: 16.
    pub initial_tree_nodes: u32,
    /// Journal size in bytes; `None` formats an unjournaled volume.
    ///
    /// Default: 512 KiB.
    pub journal_size: Option<u64>,
    /// Format HFSX with binary catalog name order.
    ///
    /// Default: false.
    pub case_sensitive: bool,
    /// Name of the root folder.
    ///
    /// Default: "untitled".
    pub volume_name: String,
    /// Creation date in HFS epoch seconds; `None` uses the current time.
    pub create_date: Option<u32>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            total_blocks: None,
            catalog_node_size: 8192,
            extents_node_size: 4096,
            initial_tree_nodes: 16,
            journal_size: Some(512 * 1024),
            case_sensitive: false,
            volume_name: "untitled".to_owned(),
            create_date: None,
        }
    }
}
