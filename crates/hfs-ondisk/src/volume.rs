use hfs_types::{
    ALTERNATE_HEADER_END_OFFSET, HFS_PLUS_SIGNATURE, HFS_WRAPPER_SIGNATURE, HFSX_SIGNATURE,
    ParseError, SECTOR_SIZE, VOLUME_HEADER_OFFSET, VOLUME_HEADER_SIZE, ensure_slice, read_be_u16,
    read_be_u32, read_be_u64, read_fixed, write_be_u16, write_be_u32, write_be_u64,
};
use serde::{Deserialize, Serialize};

/// Number of extent descriptors stored inline in a fork or extent record.
pub const EXTENT_DENSITY: usize = 8;
/// Encoded size of one [`ForkData`].
pub const FORK_DATA_SIZE: usize = 80;
/// Encoded size of an eight-extent record.
pub const EXTENT_RECORD_SIZE: usize = EXTENT_DENSITY * 8;

// ── Volume attributes ──────────────────────────────────────────────────────

/// `attributes` word of the volume header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VolumeAttributes(pub u32);

impl VolumeAttributes {
    pub const HARDWARE_LOCK: Self = Self(1 << 7);
    /// Set on clean unmount, cleared while mounted read-write.
    pub const UNMOUNTED: Self = Self(1 << 8);
    pub const SPARED_BLOCKS: Self = Self(1 << 9);
    pub const NO_CACHE_REQUIRED: Self = Self(1 << 10);
    /// Persistent "needs repair" flag.
    pub const INCONSISTENT: Self = Self(1 << 11);
    pub const CNIDS_REUSED: Self = Self(1 << 12);
    pub const JOURNALED: Self = Self(1 << 13);
    pub const SOFTWARE_LOCK: Self = Self(1 << 15);

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0
    }

    pub fn insert(&mut self, flag: Self) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: Self) {
        self.0 &= !flag.0;
    }
}

// ── Extents and forks ──────────────────────────────────────────────────────

/// One contiguous run of allocation blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

impl ExtentDescriptor {
    #[must_use]
    pub fn new(start_block: u32, block_count: u32) -> Self {
        Self {
            start_block,
            block_count,
        }
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.block_count == 0
    }

    /// One past the last block, saturating.
    #[must_use]
    pub fn end_block(self) -> u32 {
        self.start_block.saturating_add(self.block_count)
    }

    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            start_block: read_be_u32(data, offset)?,
            block_count: read_be_u32(data, offset + 4)?,
        })
    }

    pub fn encode(self, out: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_be_u32(out, offset, self.start_block)?;
        write_be_u32(out, offset + 4, self.block_count)
    }
}

/// Parse an eight-descriptor extent record.
pub fn parse_extent_record(
    data: &[u8],
    offset: usize,
) -> Result<[ExtentDescriptor; EXTENT_DENSITY], ParseError> {
    let mut out = [ExtentDescriptor::default(); EXTENT_DENSITY];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = ExtentDescriptor::parse(data, offset + i * 8)?;
    }
    Ok(out)
}

pub fn encode_extent_record(
    extents: &[ExtentDescriptor; EXTENT_DENSITY],
    out: &mut [u8],
    offset: usize,
) -> Result<(), ParseError> {
    for (i, ext) in extents.iter().enumerate() {
        ext.encode(out, offset + i * 8)?;
    }
    Ok(())
}

/// `HFSPlusForkData`: size, clump and first eight extents of a fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: [ExtentDescriptor; EXTENT_DENSITY],
}

impl ForkData {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        ensure_slice(data, offset, FORK_DATA_SIZE)?;
        Ok(Self {
            logical_size: read_be_u64(data, offset)?,
            clump_size: read_be_u32(data, offset + 8)?,
            total_blocks: read_be_u32(data, offset + 12)?,
            extents: parse_extent_record(data, offset + 16)?,
        })
    }

    pub fn encode(&self, out: &mut [u8], offset: usize) -> Result<(), ParseError> {
        ensure_slice(out, offset, FORK_DATA_SIZE)?;
        write_be_u64(out, offset, self.logical_size)?;
        write_be_u32(out, offset + 8, self.clump_size)?;
        write_be_u32(out, offset + 12, self.total_blocks)?;
        encode_extent_record(&self.extents, out, offset + 16)
    }

    /// Blocks covered by the inline extents.
    #[must_use]
    pub fn inline_blocks(&self) -> u64 {
        self.extents
            .iter()
            .map(|e| u64::from(e.block_count))
            .sum()
    }

    /// Number of used inline extent slots.
    #[must_use]
    pub fn used_extents(&self) -> usize {
        self.extents.iter().take_while(|e| !e.is_empty()).count()
    }
}

// ── Volume header ──────────────────────────────────────────────────────────

/// `HFSPlusVolumeHeader` (512 bytes at offset 1024 and 1024 before the end).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VolumeHeader {
    // ── Identity ─────────────────────────────────────────────────────────
    pub signature: u16,
    pub version: u16,
    pub attributes: VolumeAttributes,
    pub last_mounted_version: u32,
    pub journal_info_block: u32,

    // ── Dates (HFS epoch seconds) ────────────────────────────────────────
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub checked_date: u32,

    // ── Counters ─────────────────────────────────────────────────────────
    pub file_count: u32,
    pub folder_count: u32,

    // ── Geometry and allocation ──────────────────────────────────────────
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub next_allocation: u32,
    pub rsrc_clump_size: u32,
    pub data_clump_size: u32,
    pub next_catalog_id: u32,
    pub write_count: u32,
    pub encodings_bitmap: u64,
    pub finder_info: [u8; 32],

    // ── Special files ────────────────────────────────────────────────────
    pub allocation_file: ForkData,
    pub extents_file: ForkData,
    pub catalog_file: ForkData,
    pub attributes_file: ForkData,
    pub startup_file: ForkData,
}

impl VolumeHeader {
    /// Parse a header from its 512-byte region.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < VOLUME_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: VOLUME_HEADER_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let signature = read_be_u16(region, 0)?;
        if signature != HFS_PLUS_SIGNATURE && signature != HFSX_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(HFS_PLUS_SIGNATURE),
                actual: u64::from(signature),
            });
        }

        Ok(Self {
            signature,
            version: read_be_u16(region, 2)?,
            attributes: VolumeAttributes(read_be_u32(region, 4)?),
            last_mounted_version: read_be_u32(region, 8)?,
            journal_info_block: read_be_u32(region, 12)?,
            create_date: read_be_u32(region, 16)?,
            modify_date: read_be_u32(region, 20)?,
            backup_date: read_be_u32(region, 24)?,
            checked_date: read_be_u32(region, 28)?,
            file_count: read_be_u32(region, 32)?,
            folder_count: read_be_u32(region, 36)?,
            block_size: read_be_u32(region, 40)?,
            total_blocks: read_be_u32(region, 44)?,
            free_blocks: read_be_u32(region, 48)?,
            next_allocation: read_be_u32(region, 52)?,
            rsrc_clump_size: read_be_u32(region, 56)?,
            data_clump_size: read_be_u32(region, 60)?,
            next_catalog_id: read_be_u32(region, 64)?,
            write_count: read_be_u32(region, 68)?,
            encodings_bitmap: read_be_u64(region, 72)?,
            finder_info: read_fixed::<32>(region, 80)?,
            allocation_file: ForkData::parse(region, 112)?,
            extents_file: ForkData::parse(region, 192)?,
            catalog_file: ForkData::parse(region, 272)?,
            attributes_file: ForkData::parse(region, 352)?,
            startup_file: ForkData::parse(region, 432)?,
        })
    }

    /// Encode into a fresh 512-byte region.
    pub fn encode(&self) -> Result<[u8; VOLUME_HEADER_SIZE], ParseError> {
        let mut out = [0_u8; VOLUME_HEADER_SIZE];
        self.encode_into(&mut out)?;
        Ok(out)
    }

    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice(out, 0, VOLUME_HEADER_SIZE)?;
        write_be_u16(out, 0, self.signature)?;
        write_be_u16(out, 2, self.version)?;
        write_be_u32(out, 4, self.attributes.0)?;
        write_be_u32(out, 8, self.last_mounted_version)?;
        write_be_u32(out, 12, self.journal_info_block)?;
        write_be_u32(out, 16, self.create_date)?;
        write_be_u32(out, 20, self.modify_date)?;
        write_be_u32(out, 24, self.backup_date)?;
        write_be_u32(out, 28, self.checked_date)?;
        write_be_u32(out, 32, self.file_count)?;
        write_be_u32(out, 36, self.folder_count)?;
        write_be_u32(out, 40, self.block_size)?;
        write_be_u32(out, 44, self.total_blocks)?;
        write_be_u32(out, 48, self.free_blocks)?;
        write_be_u32(out, 52, self.next_allocation)?;
        write_be_u32(out, 56, self.rsrc_clump_size)?;
        write_be_u32(out, 60, self.data_clump_size)?;
        write_be_u32(out, 64, self.next_catalog_id)?;
        write_be_u32(out, 68, self.write_count)?;
        write_be_u64(out, 72, self.encodings_bitmap)?;
        out[80..112].copy_from_slice(&self.finder_info);
        self.allocation_file.encode(out, 112)?;
        self.extents_file.encode(out, 192)?;
        self.catalog_file.encode(out, 272)?;
        self.attributes_file.encode(out, 352)?;
        self.startup_file.encode(out, 432)
    }

    /// Trust check applied to both the primary and the alternate copy.
    ///
    /// Signature must be `H+` or `HX`, version in `4..=100`, and the block
    /// size a power of two of at least 512 that matches `expected_block_size`
    /// when the caller already knows it.
    pub fn validate(&self, expected_block_size: Option<u32>) -> Result<(), ParseError> {
        if self.signature != HFS_PLUS_SIGNATURE && self.signature != HFSX_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(HFS_PLUS_SIGNATURE),
                actual: u64::from(self.signature),
            });
        }
        if !(4..=100).contains(&self.version) {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "must be in 4..=100",
            });
        }
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two >= 512",
            });
        }
        if expected_block_size.is_some_and(|expected| expected != self.block_size) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "does not match mounted block size",
            });
        }
        if self.total_blocks == 0 {
            return Err(ParseError::InvalidField {
                field: "total_blocks",
                reason: "must be non-zero",
            });
        }
        if self.free_blocks > self.total_blocks {
            return Err(ParseError::InvalidField {
                field: "free_blocks",
                reason: "exceeds total_blocks",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn is_hfsx(&self) -> bool {
        self.signature == HFSX_SIGNATURE
    }

    #[must_use]
    pub fn is_journaled(&self) -> bool {
        self.attributes.contains(VolumeAttributes::JOURNALED)
    }

    #[must_use]
    pub fn is_inconsistent(&self) -> bool {
        self.attributes.contains(VolumeAttributes::INCONSISTENT)
    }

    #[must_use]
    pub fn was_cleanly_unmounted(&self) -> bool {
        self.attributes.contains(VolumeAttributes::UNMOUNTED)
    }

    /// Fork of a special file by CNID.
    #[must_use]
    pub fn special_fork(&self, cnid: hfs_types::Cnid) -> Option<&ForkData> {
        match cnid {
            hfs_types::Cnid::EXTENTS_FILE => Some(&self.extents_file),
            hfs_types::Cnid::CATALOG_FILE => Some(&self.catalog_file),
            hfs_types::Cnid::ALLOCATION_FILE => Some(&self.allocation_file),
            hfs_types::Cnid::ATTRIBUTES_FILE => Some(&self.attributes_file),
            hfs_types::Cnid::STARTUP_FILE => Some(&self.startup_file),
            _ => None,
        }
    }
}

// ── Header placement ───────────────────────────────────────────────────────

/// Byte offsets of the primary header and both alternate-header candidates.
///
/// `fs_alternate` is 1024 bytes before the end of the file system
/// (`total_blocks * block_size`); `partition_alternate` is 1024 bytes before
/// the end of the device. They differ when a smaller file system lives in a
/// larger partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderLocations {
    pub embedded_offset: u64,
    pub primary: u64,
    pub fs_alternate: u64,
    pub partition_alternate: u64,
}

impl HeaderLocations {
    /// Compute placements for a volume starting at `embedded_offset` on a
    /// device of `device_len` bytes.
    pub fn compute(
        embedded_offset: u64,
        block_size: u32,
        total_blocks: u32,
        device_len: u64,
    ) -> Result<Self, ParseError> {
        let fs_len = u64::from(block_size) * u64::from(total_blocks);
        let fs_end = embedded_offset
            .checked_add(fs_len)
            .ok_or(ParseError::InvalidField {
                field: "total_blocks",
                reason: "volume end overflows",
            })?;
        if fs_end > device_len {
            return Err(ParseError::InvalidField {
                field: "total_blocks",
                reason: "volume extends past end of device",
            });
        }
        let fs_alternate = fs_end
            .checked_sub(ALTERNATE_HEADER_END_OFFSET)
            .ok_or(ParseError::InvalidField {
                field: "total_blocks",
                reason: "volume too small for an alternate header",
            })?;
        let partition_end = device_len - device_len % SECTOR_SIZE;
        let partition_alternate = partition_end
            .checked_sub(ALTERNATE_HEADER_END_OFFSET)
            .ok_or(ParseError::InvalidField {
                field: "device_len",
                reason: "device too small",
            })?;
        Ok(Self {
            embedded_offset,
            primary: embedded_offset + VOLUME_HEADER_OFFSET,
            fs_alternate,
            partition_alternate,
        })
    }

    #[must_use]
    pub fn alternates_agree(&self) -> bool {
        self.fs_alternate == self.partition_alternate
    }
}

// ── HFS wrapper ────────────────────────────────────────────────────────────

/// The fields of a legacy HFS master directory block needed to locate an
/// embedded HFS+ volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrapperMdb {
    pub allocation_block_size: u32,
    pub allocation_block_start: u16,
    pub embed_signature: u16,
    pub embed_start_block: u16,
    pub embed_block_count: u16,
}

impl WrapperMdb {
    /// Parse an MDB region (the 512 bytes at offset 1024).
    ///
    /// Returns `Ok(None)` when the region is not an HFS MDB at all.
    pub fn parse(region: &[u8]) -> Result<Option<Self>, ParseError> {
        if read_be_u16(region, 0)? != HFS_WRAPPER_SIGNATURE {
            return Ok(None);
        }
        Ok(Some(Self {
            allocation_block_size: read_be_u32(region, 20)?,
            allocation_block_start: read_be_u16(region, 28)?,
            embed_signature: read_be_u16(region, 124)?,
            embed_start_block: read_be_u16(region, 126)?,
            embed_block_count: read_be_u16(region, 128)?,
        }))
    }

    /// True when the wrapper carries an embedded `H+` volume.
    #[must_use]
    pub fn has_embedded_volume(&self) -> bool {
        self.embed_signature == HFS_PLUS_SIGNATURE
    }

    /// Byte offset of the embedded volume from the start of the device.
    #[must_use]
    pub fn embedded_offset(&self) -> u64 {
        u64::from(self.allocation_block_start) * SECTOR_SIZE
            + u64::from(self.embed_start_block) * u64::from(self.allocation_block_size)
    }

    /// Length in bytes of the embedded volume.
    #[must_use]
    pub fn embedded_len(&self) -> u64 {
        u64::from(self.embed_block_count) * u64::from(self.allocation_block_size)
    }
}

// ── Journal info block ─────────────────────────────────────────────────────

/// Size of the on-disk journal info block.
pub const JOURNAL_INFO_BLOCK_SIZE: usize = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JournalInfoFlags(pub u32);

impl JournalInfoFlags {
    pub const IN_FS: Self = Self(1);
    pub const ON_OTHER_DEVICE: Self = Self(2);
    pub const NEED_INIT: Self = Self(4);

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0
    }
}

/// Location of the journal relative to the start of the HFS+ volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalInfoBlock {
    pub flags: JournalInfoFlags,
    pub device_signature: [u8; 32],
    pub offset: u64,
    pub size: u64,
}

impl JournalInfoBlock {
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(region, 0, JOURNAL_INFO_BLOCK_SIZE)?;
        Ok(Self {
            flags: JournalInfoFlags(read_be_u32(region, 0)?),
            device_signature: read_fixed::<32>(region, 4)?,
            offset: read_be_u64(region, 36)?,
            size: read_be_u64(region, 44)?,
        })
    }

    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice(out, 0, JOURNAL_INFO_BLOCK_SIZE)?;
        out[..JOURNAL_INFO_BLOCK_SIZE].fill(0);
        write_be_u32(out, 0, self.flags.0)?;
        out[4..36].copy_from_slice(&self.device_signature);
        write_be_u64(out, 36, self.offset)?;
        write_be_u64(out, 44, self.size)
    }
}

// ── Fork mapping ───────────────────────────────────────────────────────────

/// Resolved extent list of a file, mapping file byte offsets to device byte
/// offsets.
///
/// Holds the inline extents plus any overflow extents already looked up.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtentMap {
    block_size: u32,
    volume_offset: u64,
    extents: Vec<ExtentDescriptor>,
}

impl ExtentMap {
    #[must_use]
    pub fn new(block_size: u32, volume_offset: u64, extents: Vec<ExtentDescriptor>) -> Self {
        let extents = extents.into_iter().filter(|e| !e.is_empty()).collect();
        Self {
            block_size,
            volume_offset,
            extents,
        }
    }

    #[must_use]
    pub fn from_fork(block_size: u32, volume_offset: u64, fork: &ForkData) -> Self {
        Self::new(block_size, volume_offset, fork.extents.to_vec())
    }

    #[must_use]
    pub fn extents(&self) -> &[ExtentDescriptor] {
        &self.extents
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn volume_offset(&self) -> u64 {
        self.volume_offset
    }

    /// Blocks covered by all extents.
    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.extents.iter().map(|e| u64::from(e.block_count)).sum()
    }

    /// Bytes covered by all extents.
    #[must_use]
    pub fn physical_len(&self) -> u64 {
        self.total_blocks() * u64::from(self.block_size)
    }

    /// Append an extent, merging with the last one when adjacent.
    pub fn push(&mut self, extent: ExtentDescriptor) {
        if extent.is_empty() {
            return;
        }
        match self.extents.last_mut() {
            Some(last) if last.end_block() == extent.start_block => {
                last.block_count += extent.block_count;
            }
            _ => self.extents.push(extent),
        }
    }

    /// Remove `blocks` blocks from the end of the file, returning the freed
    /// runs (last run first).
    pub fn truncate_blocks(&mut self, mut blocks: u64) -> Vec<ExtentDescriptor> {
        let mut freed = Vec::new();
        while blocks > 0 {
            let Some(last) = self.extents.last_mut() else {
                break;
            };
            let count = u64::from(last.block_count);
            if count <= blocks {
                freed.push(*last);
                blocks -= count;
                self.extents.pop();
            } else {
                // blocks < count <= u32::MAX
                let take = u32::try_from(blocks).unwrap_or(last.block_count);
                last.block_count -= take;
                freed.push(ExtentDescriptor::new(last.end_block(), take));
                blocks = 0;
            }
        }
        freed
    }

    /// Device byte offset of `[file_offset, file_offset + len)`.
    ///
    /// Returns `None` when the range is not mapped or spans two extents.
    #[must_use]
    pub fn map_range(&self, file_offset: u64, len: u64) -> Option<u64> {
        let bs = u64::from(self.block_size);
        let mut extent_start = 0_u64;
        for ext in &self.extents {
            let extent_len = u64::from(ext.block_count) * bs;
            let extent_end = extent_start + extent_len;
            if file_offset < extent_end {
                if file_offset + len > extent_end {
                    return None;
                }
                let within = file_offset - extent_start;
                return Some(self.volume_offset + u64::from(ext.start_block) * bs + within);
            }
            extent_start = extent_end;
        }
        None
    }

    /// Inline view of the first eight extents for the volume header.
    #[must_use]
    pub fn inline_extents(&self) -> [ExtentDescriptor; EXTENT_DENSITY] {
        let mut out = [ExtentDescriptor::default(); EXTENT_DENSITY];
        for (slot, ext) in out.iter_mut().zip(&self.extents) {
            *slot = *ext;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfs_types::{Cnid, LAST_MOUNTED_JOURNALED};

    pub(crate) fn sample_header() -> VolumeHeader {
        let mut catalog = ForkData {
            logical_size: 8 * 4096,
            clump_size: 4096 * 4,
            total_blocks: 8,
            ..ForkData::default()
        };
        catalog.extents[0] = ExtentDescriptor::new(40, 8);
        VolumeHeader {
            signature: HFS_PLUS_SIGNATURE,
            version: 4,
            attributes: VolumeAttributes(VolumeAttributes::UNMOUNTED.0 | VolumeAttributes::JOURNALED.0),
            last_mounted_version: LAST_MOUNTED_JOURNALED,
            journal_info_block: 3,
            create_date: 1,
            modify_date: 2,
            backup_date: 0,
            checked_date: 3,
            file_count: 10,
            folder_count: 4,
            block_size: 4096,
            total_blocks: 1000,
            free_blocks: 900,
            next_allocation: 60,
            rsrc_clump_size: 65536,
            data_clump_size: 65536,
            next_catalog_id: 30,
            write_count: 7,
            encodings_bitmap: 1,
            finder_info: [0_u8; 32],
            allocation_file: ForkData::default(),
            extents_file: ForkData::default(),
            catalog_file: catalog,
            attributes_file: ForkData::default(),
            startup_file: ForkData::default(),
        }
    }

    #[test]
    fn header_encode_parse_preserves_fields() {
        let header = sample_header();
        let bytes = header.encode().expect("encode");
        assert_eq!(&bytes[0..2], b"H+");
        let parsed = VolumeHeader::parse(&bytes).expect("parse");
        assert_eq!(parsed, header);
        assert_eq!(parsed.catalog_file.extents[0].start_block, 40);
        assert_eq!(
            parsed.special_fork(Cnid::CATALOG_FILE).map(|f| f.total_blocks),
            Some(8)
        );
    }

    #[test]
    fn header_field_offsets_match_layout() {
        let header = sample_header();
        let bytes = header.encode().expect("encode");
        assert_eq!(read_be_u32(&bytes, 40).expect("bs"), 4096);
        assert_eq!(read_be_u32(&bytes, 52).expect("next"), 60);
        // catalogFile.extents[0].startBlock
        assert_eq!(read_be_u32(&bytes, 272 + 16).expect("cat"), 40);
    }

    #[test]
    fn bad_signature_is_invalid_magic() {
        let mut bytes = sample_header().encode().expect("encode");
        bytes[0] = 0;
        assert!(matches!(
            VolumeHeader::parse(&bytes),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn validate_rejects_version_and_block_size_mismatch() {
        let mut header = sample_header();
        assert!(header.validate(Some(4096)).is_ok());
        assert!(header.validate(Some(8192)).is_err());
        header.version = 3;
        assert!(header.validate(None).is_err());
        header.version = 101;
        assert!(header.validate(None).is_err());
        header.version = 5;
        header.block_size = 3000;
        assert!(header.validate(None).is_err());
    }

    #[test]
    fn attribute_flags() {
        let header = sample_header();
        assert!(header.is_journaled());
        assert!(header.was_cleanly_unmounted());
        assert!(!header.is_inconsistent());
        let mut attrs = header.attributes;
        attrs.insert(VolumeAttributes::INCONSISTENT);
        attrs.remove(VolumeAttributes::UNMOUNTED);
        assert!(attrs.contains(VolumeAttributes::INCONSISTENT));
        assert!(!attrs.contains(VolumeAttributes::UNMOUNTED));
    }

    #[test]
    fn wrapper_mdb_embedded_offset() {
        let mut mdb = [0_u8; 512];
        write_be_u16(&mut mdb, 0, HFS_WRAPPER_SIGNATURE).expect("sig");
        write_be_u32(&mut mdb, 20, 1024).expect("alblksiz");
        write_be_u16(&mut mdb, 28, 6).expect("alblst");
        write_be_u16(&mut mdb, 124, HFS_PLUS_SIGNATURE).expect("embed sig");
        write_be_u16(&mut mdb, 126, 10).expect("embed start");
        write_be_u16(&mut mdb, 128, 200).expect("embed count");
        let parsed = WrapperMdb::parse(&mdb).expect("parse").expect("is mdb");
        assert!(parsed.has_embedded_volume());
        assert_eq!(parsed.embedded_offset(), 6 * 512 + 10 * 1024);
        assert_eq!(parsed.embedded_len(), 200 * 1024);

        let plain = [0_u8; 512];
        assert_eq!(WrapperMdb::parse(&plain).expect("parse"), None);
    }

    #[test]
    fn header_locations_for_smaller_fs_in_larger_partition() {
        let loc = HeaderLocations::compute(0, 4096, 100, 4096 * 200).expect("compute");
        assert_eq!(loc.primary, 1024);
        assert_eq!(loc.fs_alternate, 4096 * 100 - 1024);
        assert_eq!(loc.partition_alternate, 4096 * 200 - 1024);
        assert!(!loc.alternates_agree());

        let same = HeaderLocations::compute(0, 4096, 100, 4096 * 100).expect("compute");
        assert!(same.alternates_agree());
        assert!(HeaderLocations::compute(0, 4096, 101, 4096 * 100).is_err());
    }

    #[test]
    fn journal_info_block_round_trip() {
        let jib = JournalInfoBlock {
            flags: JournalInfoFlags(JournalInfoFlags::IN_FS.0 | JournalInfoFlags::NEED_INIT.0),
            device_signature: [0; 32],
            offset: 0x10_0000,
            size: 0x8_0000,
        };
        let mut buf = [0xAA_u8; 512];
        jib.encode_into(&mut buf).expect("encode");
        let parsed = JournalInfoBlock::parse(&buf).expect("parse");
        assert_eq!(parsed, jib);
        assert!(parsed.flags.contains(JournalInfoFlags::NEED_INIT));
        assert!(!parsed.flags.contains(JournalInfoFlags::ON_OTHER_DEVICE));
    }

    #[test]
    fn extent_map_translates_and_refuses_straddling() {
        let map = ExtentMap::new(
            4096,
            8192,
            vec![ExtentDescriptor::new(10, 2), ExtentDescriptor::new(50, 4)],
        );
        assert_eq!(map.total_blocks(), 6);
        assert_eq!(map.map_range(0, 4096), Some(8192 + 10 * 4096));
        assert_eq!(map.map_range(4096 * 2, 4096), Some(8192 + 50 * 4096));
        assert_eq!(map.map_range(4096, 8192), None, "spans two extents");
        assert_eq!(map.map_range(4096 * 6, 512), None, "past end");
    }

    #[test]
    fn extent_map_push_merges_and_truncate_frees_tail() {
        let mut map = ExtentMap::new(512, 0, vec![ExtentDescriptor::new(10, 2)]);
        map.push(ExtentDescriptor::new(12, 3));
        assert_eq!(map.extents(), &[ExtentDescriptor::new(10, 5)]);
        map.push(ExtentDescriptor::new(40, 4));
        assert_eq!(map.extents().len(), 2);

        let freed = map.truncate_blocks(6);
        assert_eq!(
            freed,
            vec![ExtentDescriptor::new(40, 4), ExtentDescriptor::new(13, 2)]
        );
        assert_eq!(map.extents(), &[ExtentDescriptor::new(10, 3)]);
    }
}
