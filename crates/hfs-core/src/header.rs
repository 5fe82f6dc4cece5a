//! Volume-header location, validation and flush.
//!
//! The primary header sits 1024 bytes into the (possibly embedded) volume.
//! Alternates sit 1024 bytes before the end of the file system and 1024
//! bytes before the end of the partition; usually those are the same
//! place. Mount trusts a copy only after it validates on its own.

use crate::parse_error;
use crate::state::InconsistentReason;
use crate::volume::Volume;
use hfs_block::{BufKey, ByteDevice, GetMode, read_header_region};
use hfs_error::{HfsError, Result};
use hfs_journal::Transaction;
use hfs_ondisk::{VolumeAttributes, VolumeHeader, WrapperMdb};
use hfs_types::{
    ALTERNATE_HEADER_END_OFFSET, ByteOffset, FileId, HFS_PLUS_SIGNATURE, HFSX_SIGNATURE,
    LAST_MOUNTED_FSCK, LAST_MOUNTED_JOURNALED, LAST_MOUNTED_PLAIN, ParseError, SECTOR_SIZE,
    VOLUME_HEADER_OFFSET, VOLUME_HEADER_SIZE, read_be_u16, write_be_u32,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Byte offset of `lastMountedVersion` inside the header.
const LAST_MOUNTED_VERSION_OFFSET: usize = 8;

/// How [`Volume::flush_header`] treats a clean header and the alternates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushOptions {
    /// Skip the flush when nothing changed.
    pub if_dirty: bool,
    /// Rewrite the alternate copies even if no special-file fork changed.
    pub write_alternate: bool,
}

impl FlushOptions {
    pub const IF_DIRTY: Self = Self {
        if_dirty: true,
        write_alternate: false,
    };
    pub const WAIT: Self = Self {
        if_dirty: false,
        write_alternate: false,
    };

    #[must_use]
    pub fn with_alternate(mut self) -> Self {
        self.write_alternate = true;
        self
    }
}

// ── Mount-time discovery ───────────────────────────────────────────────────

/// A validated header and where the volume lives on the device.
#[derive(Debug, Clone)]
pub(crate) struct LocatedHeader {
    pub(crate) header: VolumeHeader,
    pub(crate) embedded_offset: u64,
    /// End of the partition holding the volume.
    pub(crate) volume_end: u64,
    /// The primary failed validation and the alternate was used.
    pub(crate) used_alternate: bool,
}

/// Find and validate the volume header, looking through an HFS wrapper
/// and falling back to the partition alternate.
pub(crate) fn locate(device: &dyn ByteDevice) -> Result<LocatedHeader> {
    let region = read_header_region(device, 0)?;
    let (embedded_offset, volume_end) = match WrapperMdb::parse(&region).map_err(parse_error)? {
        Some(mdb) if mdb.has_embedded_volume() => {
            let offset = mdb.embedded_offset();
            info!(target: "hfs::volume", offset, len = mdb.embedded_len(), "volume_wrapper_detected");
            (offset, offset.saturating_add(mdb.embedded_len()))
        }
        Some(_) => {
            return Err(HfsError::UnsupportedFeature(
                "HFS wrapper without an embedded HFS+ volume".to_owned(),
            ));
        }
        None => {
            let signature = read_be_u16(&region, 0).map_err(parse_error)?;
            if signature != HFS_PLUS_SIGNATURE && signature != HFSX_SIGNATURE {
                return Err(HfsError::Format(format!(
                    "no HFS+ signature at offset 1024 (found {signature:#06x})"
                )));
            }
            (0, device.len_bytes())
        }
    };
    let volume_end = volume_end.min(device.len_bytes());

    let primary = embedded_offset + VOLUME_HEADER_OFFSET;
    let primary_err = match read_validated(device, primary, None) {
        Ok(header) => {
            return Ok(LocatedHeader {
                header,
                embedded_offset,
                volume_end,
                used_alternate: false,
            });
        }
        Err(err) => err,
    };
    warn!(target: "hfs::volume", offset = primary, err = %primary_err, "volume_primary_header_invalid");

    let alternate = (volume_end - volume_end % SECTOR_SIZE)
        .checked_sub(ALTERNATE_HEADER_END_OFFSET)
        .ok_or_else(|| HfsError::InvalidGeometry("device too small for a volume".to_owned()))?;
    match read_validated(device, alternate, None) {
        Ok(header) => {
            warn!(target: "hfs::volume", offset = alternate, "volume_alternate_header_used");
            Ok(LocatedHeader {
                header,
                embedded_offset,
                volume_end,
                used_alternate: true,
            })
        }
        Err(alt_err) => {
            error!(target: "hfs::volume", offset = alternate, err = %alt_err, "volume_alternate_header_invalid");
            Err(primary_err)
        }
    }
}

/// Read the header copy at `offset` and validate it.
pub(crate) fn read_validated(
    device: &dyn ByteDevice,
    offset: u64,
    block_size: Option<u32>,
) -> Result<VolumeHeader> {
    let mut buf = [0_u8; VOLUME_HEADER_SIZE];
    device.read_exact_at(ByteOffset(offset), &mut buf)?;
    let header = VolumeHeader::parse(&buf).map_err(|err| header_format_error(offset, &err))?;
    header
        .validate(block_size)
        .map_err(|err| header_format_error(offset, &err))?;
    Ok(header)
}

fn header_format_error(offset: u64, err: &ParseError) -> HfsError {
    HfsError::Format(format!("volume header at {offset}: {err}"))
}

/// Structural check of a header copy held in a buffer.
fn check_copy(bytes: &[u8], block_size: u32) -> std::result::Result<(), ParseError> {
    VolumeHeader::parse(bytes)?.validate(Some(block_size))
}

/// Rewrite the on-disk `lastMountedVersion` as `FSK!` so the next checker
/// run is forced, leaving the rest of the header as it is.
pub(crate) fn write_fsck_marker(device: &dyn ByteDevice, primary: u64) -> Result<()> {
    let mut buf = [0_u8; VOLUME_HEADER_SIZE];
    device.read_exact_at(ByteOffset(primary), &mut buf)?;
    let signature = read_be_u16(&buf, 0).map_err(parse_error)?;
    if signature != HFS_PLUS_SIGNATURE && signature != HFSX_SIGNATURE {
        return Ok(());
    }
    write_be_u32(&mut buf, LAST_MOUNTED_VERSION_OFFSET, LAST_MOUNTED_FSCK).map_err(parse_error)?;
    device.write_all_at(ByteOffset(primary), &buf)?;
    device.sync()?;
    warn!(target: "hfs::volume", offset = primary, "volume_fsck_marker_written");
    Ok(())
}

fn header_key(offset: u64) -> BufKey {
    BufKey::new(FileId::DEVICE, offset / SECTOR_SIZE)
}

// ── Flush ──────────────────────────────────────────────────────────────────

impl Volume {
    /// Write the in-memory header to the primary location inside `txn`,
    /// and to the alternates when asked or when a special-file fork moved.
    ///
    /// Returns false when `opts.if_dirty` skipped a clean header.
    pub(crate) fn flush_header(
        &self,
        txn: &mut Transaction<'_>,
        opts: FlushOptions,
    ) -> Result<bool> {
        let Some(snapshot) = self.state.snapshot(opts.if_dirty) else {
            return Ok(false);
        };
        let mut header = snapshot.header;
        header.free_blocks = self.allocator.free_blocks();
        header.next_allocation = self.allocator.next_allocation();
        header.last_mounted_version = if txn.journal().is_logged() {
            LAST_MOUNTED_JOURNALED
        } else {
            LAST_MOUNTED_PLAIN
        };

        let primary = self.locations.primary;
        let mut guard = self.cache.get(
            header_key(primary),
            ByteOffset(primary),
            VOLUME_HEADER_SIZE,
            GetMode::Read,
        )?;
        if let Err(err) = check_copy(&guard, self.block_size) {
            error!(target: "hfs::volume", offset = primary, %err, "volume_primary_header_corrupt");
            let _ = self.state.mark_inconsistent(InconsistentReason::DetectedCorruption);
            header.attributes.insert(VolumeAttributes::INCONSISTENT);
        }
        let bytes = header.encode().map_err(parse_error)?;

        txn.modify_start(&guard)?;
        guard.copy_from_slice(&bytes);
        txn.modify_end(guard, None)?;

        let write_alternate = opts.write_alternate || snapshot.alternate_due;
        if write_alternate {
            self.write_alternates(txn, &bytes)?;
        }
        self.state
            .flushed(snapshot.generation, write_alternate, &header);
        debug!(
            target: "hfs::volume",
            free_blocks = header.free_blocks,
            next_allocation = header.next_allocation,
            alternate = write_alternate,
            "volume_header_flush"
        );
        Ok(true)
    }

    /// The file-system alternate goes through the journal; a partition
    /// alternate at a different place is written straight to the device.
    fn write_alternates(&self, txn: &mut Transaction<'_>, bytes: &[u8]) -> Result<()> {
        let loc = self.locations;
        let mut guard = self.cache.get(
            header_key(loc.fs_alternate),
            ByteOffset(loc.fs_alternate),
            VOLUME_HEADER_SIZE,
            GetMode::Empty,
        )?;
        txn.modify_start(&guard)?;
        guard.copy_from_slice(bytes);
        txn.modify_end(guard, None)?;
        if !loc.alternates_agree() {
            self.device
                .write_all_at(ByteOffset(loc.partition_alternate), bytes)?;
            debug!(target: "hfs::volume", offset = loc.partition_alternate, "volume_partition_alternate_write");
        }
        Ok(())
    }
}
