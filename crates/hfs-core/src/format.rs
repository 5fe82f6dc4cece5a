//! Lay out a fresh HFS+ volume.
//!
//! Block layout, front to back: the blocks holding the boot area and the
//! primary header, the allocation bitmap, the journal info block and the
//! journal ring (journaled volumes only), the extents tree, the catalog
//! tree. The blocks covering the last 1024 bytes of the file system hold
//! the alternate header and are marked used.

use crate::config::FormatOptions;
use crate::parse_error;
use hfs_alloc::{AllocGeometry, Allocator, AllocatorConfig};
use hfs_block::{BufferCache, ByteDevice, CacheConfig};
use hfs_btree::{BTree, ExtentKeys, TreeParams, compare};
use hfs_error::{HfsError, Result};
use hfs_journal::{Journal, JournalConfig};
use hfs_ondisk::{
    CatalogKey, CatalogRecord, ExtentDescriptor, ExtentMap, ForkData, FolderRecord,
    HeaderLocations, JOURNAL_INFO_BLOCK_SIZE, JournalInfoBlock, JournalInfoFlags, ThreadRecord,
    UniName, VolumeAttributes, VolumeHeader,
};
use hfs_types::{
    ByteOffset, Cnid, FileId, HFS_PLUS_SIGNATURE, HFS_PLUS_VERSION, HFSX_SIGNATURE, HFSX_VERSION,
    LAST_MOUNTED_JOURNALED, LAST_MOUNTED_PLAIN, SECTOR_SIZE, VOLUME_HEADER_OFFSET,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Boot blocks plus the primary header.
const LEADING_RESERVED_BYTES: u64 = VOLUME_HEADER_OFFSET + SECTOR_SIZE;
/// Alternate header plus the trailing reserved sector.
const TRAILING_RESERVED_BYTES: u64 = 1024;
/// Encoding bit 0: MacRoman, the encoding of an ASCII volume name.
const MAC_ROMAN_ENCODING_BIT: u64 = 1;
const DEFAULT_FORK_CLUMP: u32 = 64 * 1024;

/// Block ranges chosen for a new volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    total_blocks: u32,
    leading: ExtentDescriptor,
    bitmap: ExtentDescriptor,
    journal_info: Option<ExtentDescriptor>,
    journal: Option<ExtentDescriptor>,
    extents: ExtentDescriptor,
    catalog: ExtentDescriptor,
    trailing: ExtentDescriptor,
}

impl Layout {
    fn plan(opts: &FormatOptions, device_len: u64) -> Result<Self> {
        let bs = opts.block_size;
        if bs < 512 || !bs.is_power_of_two() {
            return Err(HfsError::InvalidGeometry(format!(
                "block size {bs} is not a power of two >= 512"
            )));
        }
        let bs64 = u64::from(bs);
        let fits = u32::try_from(device_len / bs64).unwrap_or(u32::MAX);
        let total_blocks = opts.total_blocks.unwrap_or(fits);
        if total_blocks > fits {
            return Err(HfsError::InvalidGeometry(format!(
                "{total_blocks} blocks of {bs} bytes exceed a {device_len}-byte device"
            )));
        }

        let blocks_for = |bytes: u64| -> Result<u32> {
            u32::try_from(bytes.div_ceil(bs64))
                .map_err(|_| HfsError::InvalidGeometry(format!("{bytes} bytes is too large")))
        };
        let mut next = 0_u32;
        let mut take = |count: u32| {
            let run = ExtentDescriptor::new(next, count);
            next = next.saturating_add(count);
            run
        };

        let leading = take(blocks_for(LEADING_RESERVED_BYTES)?);
        let bitmap = take(total_blocks.div_ceil(bs.saturating_mul(8)).max(1));
        let (journal_info, journal) = match opts.journal_size {
            Some(size) => {
                if size == 0 || size % SECTOR_SIZE != 0 {
                    return Err(HfsError::InvalidGeometry(format!(
                        "journal size {size} is not a non-zero multiple of 512"
                    )));
                }
                let info = take(1);
                (Some(info), Some(take(blocks_for(size)?)))
            }
            None => (None, None),
        };
        let tree_blocks = |node_size: u16| {
            blocks_for(u64::from(node_size) * u64::from(opts.initial_tree_nodes))
        };
        let extents = take(tree_blocks(opts.extents_node_size)?);
        let catalog = take(tree_blocks(opts.catalog_node_size)?);

        let trailing_count = blocks_for(TRAILING_RESERVED_BYTES)?;
        if u64::from(next) + u64::from(trailing_count) > u64::from(total_blocks) {
            return Err(HfsError::InvalidGeometry(format!(
                "volume of {total_blocks} blocks cannot hold {next} metadata blocks"
            )));
        }
        let trailing = ExtentDescriptor::new(total_blocks - trailing_count, trailing_count);
        Ok(Self {
            total_blocks,
            leading,
            bitmap,
            journal_info,
            journal,
            extents,
            catalog,
            trailing,
        })
    }

    fn used(&self) -> impl Iterator<Item = ExtentDescriptor> {
        [
            Some(self.leading),
            Some(self.bitmap),
            self.journal_info,
            self.journal,
            Some(self.extents),
            Some(self.catalog),
            Some(self.trailing),
        ]
        .into_iter()
        .flatten()
    }
}

fn fork_of(run: ExtentDescriptor, block_size: u32, logical_size: u64, clump: u32) -> ForkData {
    let mut fork = ForkData {
        logical_size,
        clump_size: clump,
        total_blocks: run.block_count,
        ..ForkData::default()
    };
    fork.extents[0] = run;
    debug_assert!(logical_size <= u64::from(run.block_count) * u64::from(block_size));
    fork
}

fn run_bytes(run: ExtentDescriptor, block_size: u32) -> u64 {
    u64::from(run.block_count) * u64::from(block_size)
}

/// Format `device` as an empty HFS+ (or HFSX) volume and return the header
/// written.
///
/// The volume is left cleanly unmounted.
pub fn format_volume(device: Arc<dyn ByteDevice>, opts: &FormatOptions) -> Result<VolumeHeader> {
    let layout = Layout::plan(opts, device.len_bytes())?;
    let bs = opts.block_size;
    let now = opts.create_date.unwrap_or_else(crate::hfs_now);
    let volume_name =
        UniName::from_str_lossless(&opts.volume_name).map_err(|_| HfsError::NameTooLong)?;
    let locations =
        HeaderLocations::compute(0, bs, layout.total_blocks, device.len_bytes()).map_err(parse_error)?;
    debug!(target: "hfs::volume", ?layout, "format_layout");

    // A stale bitmap would leak into the new allocator's accounting.
    let zeros = vec![0_u8; bs as usize];
    for block in layout.bitmap.start_block..layout.bitmap.end_block() {
        device.write_all_at(ByteOffset(u64::from(block) * u64::from(bs)), &zeros)?;
    }

    let cache = BufferCache::new(Arc::clone(&device), CacheConfig::default());
    let journal = Journal::direct(cache.clone(), JournalConfig::default());
    let allocator = Allocator::new(
        cache.clone(),
        AllocGeometry {
            total_blocks: layout.total_blocks,
            block_size: bs,
            volume_offset: 0,
            bitmap: ExtentMap::new(bs, 0, vec![layout.bitmap]),
        },
        AllocatorConfig::default(),
        layout.total_blocks,
        0,
    )?;

    let extents_params = TreeParams::extents(opts.extents_node_size);
    let catalog_params = TreeParams::catalog(opts.catalog_node_size, opts.case_sensitive);
    let (extents_header, catalog_header) = {
        let mut txn = journal.begin()?;
        for run in layout.used() {
            allocator.mark_used(&mut txn, run)?;
        }
        let extents = BTree::format(
            &mut txn,
            cache.clone(),
            FileId::EXTENTS,
            ExtentMap::new(bs, 0, vec![layout.extents]),
            &extents_params,
            Arc::new(ExtentKeys),
            None,
        )?;
        let catalog = BTree::format(
            &mut txn,
            cache.clone(),
            FileId::CATALOG,
            ExtentMap::new(bs, 0, vec![layout.catalog]),
            &catalog_params,
            compare::for_file(FileId::CATALOG, catalog_params.key_compare_type),
            None,
        )?;

        let root = CatalogRecord::Folder(FolderRecord::new(Cnid::ROOT_FOLDER, now));
        let thread = CatalogRecord::FolderThread(ThreadRecord {
            parent_id: Cnid::ROOT_PARENT,
            name: volume_name.clone(),
        });
        let root_key = CatalogKey::new(Cnid::ROOT_PARENT, volume_name);
        catalog.insert(
            &mut txn,
            &root_key.encode(),
            &root.encode().map_err(parse_error)?,
        )?;
        catalog.insert(
            &mut txn,
            &CatalogKey::thread(Cnid::ROOT_FOLDER).encode(),
            &thread.encode().map_err(parse_error)?,
        )?;
        let _ = txn.commit()?;
        (extents.header(), catalog.header())
    };

    let mut attributes = VolumeAttributes::default();
    attributes.insert(VolumeAttributes::UNMOUNTED);
    if layout.journal.is_some() {
        attributes.insert(VolumeAttributes::JOURNALED);
    }
    let (signature, version) = if opts.case_sensitive {
        (HFSX_SIGNATURE, HFSX_VERSION)
    } else {
        (HFS_PLUS_SIGNATURE, HFS_PLUS_VERSION)
    };
    let header = VolumeHeader {
        signature,
        version,
        attributes,
        last_mounted_version: if layout.journal.is_some() {
            LAST_MOUNTED_JOURNALED
        } else {
            LAST_MOUNTED_PLAIN
        },
        journal_info_block: layout.journal_info.map_or(0, |run| run.start_block),
        create_date: now,
        modify_date: now,
        checked_date: now,
        block_size: bs,
        total_blocks: layout.total_blocks,
        free_blocks: allocator.free_blocks(),
        next_allocation: layout.catalog.end_block(),
        rsrc_clump_size: DEFAULT_FORK_CLUMP,
        data_clump_size: DEFAULT_FORK_CLUMP,
        next_catalog_id: Cnid::FIRST_USER.0,
        encodings_bitmap: MAC_ROMAN_ENCODING_BIT,
        allocation_file: fork_of(layout.bitmap, bs, run_bytes(layout.bitmap, bs), bs),
        extents_file: fork_of(
            layout.extents,
            bs,
            run_bytes(layout.extents, bs),
            extents_header.clump_size,
        ),
        catalog_file: fork_of(
            layout.catalog,
            bs,
            run_bytes(layout.catalog, bs),
            catalog_header.clump_size,
        ),
        ..VolumeHeader::default()
    };
    let bytes = header.encode().map_err(parse_error)?;
    device.write_all_at(ByteOffset(locations.primary), &bytes)?;
    device.write_all_at(ByteOffset(locations.fs_alternate), &bytes)?;
    if !locations.alternates_agree() {
        device.write_all_at(ByteOffset(locations.partition_alternate), &bytes)?;
    }

    if let (Some(info), Some(ring)) = (layout.journal_info, layout.journal) {
        let jib = JournalInfoBlock {
            flags: JournalInfoFlags::IN_FS,
            device_signature: [0; 32],
            offset: u64::from(ring.start_block) * u64::from(bs),
            size: opts.journal_size.unwrap_or_else(|| run_bytes(ring, bs)),
        };
        let mut block = vec![0_u8; bs as usize];
        jib.encode_into(&mut block[..JOURNAL_INFO_BLOCK_SIZE])
            .map_err(parse_error)?;
        device.write_all_at(ByteOffset(u64::from(info.start_block) * u64::from(bs)), &block)?;
        let _ = Journal::create(
            cache.clone(),
            ByteOffset(jib.offset),
            jib.size,
            JournalConfig::default(),
        )?;
    }

    let _ = cache.flush_dirty()?;
    device.sync()?;
    info!(
        target: "hfs::volume",
        block_size = bs,
        total_blocks = header.total_blocks,
        free_blocks = header.free_blocks,
        journaled = header.is_journaled(),
        case_sensitive = opts.case_sensitive,
        "volume_formatted"
    );
    Ok(header)
}
