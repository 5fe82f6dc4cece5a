//! Circular transaction area that follows the journal header.
//!
//! Positions are byte offsets from the start of the journal and always lie
//! in `[header_size, size)`. One journal block between `end` and `start`
//! stays unused so a full ring never looks empty.

use crate::JournalError;
use hfs_block::ByteDevice;
use hfs_error::{HfsError, Result};
use hfs_types::ByteOffset;
use std::sync::Arc;

/// Smallest ring accepted, in journal blocks.
pub(crate) const MIN_RING_BLOCKS: u64 = 8;

const ZERO_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub(crate) struct Ring {
    device: Arc<dyn ByteDevice>,
    base: ByteOffset,
    header_size: u64,
    size: u64,
    block_size: u64,
}

fn to_usize(len: u64) -> Result<usize> {
    usize::try_from(len)
        .map_err(|_| HfsError::InvalidGeometry(format!("journal span {len} exceeds address space")))
}

impl Ring {
    pub(crate) fn new(
        device: Arc<dyn ByteDevice>,
        base: ByteOffset,
        header_size: u64,
        size: u64,
        block_size: u64,
    ) -> std::result::Result<Self, JournalError> {
        if block_size < 512 || !block_size.is_power_of_two() {
            return Err(JournalError::Geometry(format!(
                "journal block size {block_size} is not a power of two >= 512"
            )));
        }
        if header_size == 0 || header_size % block_size != 0 {
            return Err(JournalError::Geometry(format!(
                "journal header size {header_size} is not a multiple of {block_size}"
            )));
        }
        if size % block_size != 0 || size < header_size + MIN_RING_BLOCKS * block_size {
            return Err(JournalError::Geometry(format!(
                "journal size {size} too small or unaligned"
            )));
        }
        let end = base.checked_add(size).ok_or_else(|| {
            JournalError::Geometry(format!("journal at {} overflows", base.0))
        })?;
        if end.0 > device.len_bytes() {
            return Err(JournalError::Geometry(format!(
                "journal [{}, {}) past device end {}",
                base.0,
                end.0,
                device.len_bytes()
            )));
        }
        Ok(Self {
            device,
            base,
            header_size,
            size,
            block_size,
        })
    }

    pub(crate) fn header_size(&self) -> u64 {
        self.header_size
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn block_size(&self) -> u64 {
        self.block_size
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.size - self.header_size
    }

    /// Largest record the ring can ever hold.
    pub(crate) fn max_record_len(&self) -> u64 {
        self.capacity() - self.block_size
    }

    pub(crate) fn contains(&self, pos: u64) -> bool {
        pos >= self.header_size && pos < self.size && (pos - self.header_size) % self.block_size == 0
    }

    pub(crate) fn advance(&self, pos: u64, len: u64) -> u64 {
        self.header_size + (pos - self.header_size + len) % self.capacity()
    }

    /// Bytes from `from` forward to `to`.
    pub(crate) fn distance(&self, from: u64, to: u64) -> u64 {
        (to + self.capacity() - from) % self.capacity()
    }

    /// Bytes that can be appended at `end` without reaching `start`.
    pub(crate) fn free(&self, start: u64, end: u64) -> u64 {
        self.max_record_len().saturating_sub(self.distance(start, end))
    }

    fn device_offset(&self, pos: u64) -> ByteOffset {
        ByteOffset(self.base.0 + pos)
    }

    pub(crate) fn read(&self, pos: u64, len: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; to_usize(len)?];
        let first = to_usize(len.min(self.size - pos))?;
        self.device
            .read_exact_at(self.device_offset(pos), &mut buf[..first])?;
        if first < buf.len() {
            self.device
                .read_exact_at(self.device_offset(self.header_size), &mut buf[first..])?;
        }
        Ok(buf)
    }

    pub(crate) fn write(&self, pos: u64, data: &[u8]) -> Result<()> {
        let first = to_usize((data.len() as u64).min(self.size - pos))?;
        self.device
            .write_all_at(self.device_offset(pos), &data[..first])?;
        if first < data.len() {
            self.device
                .write_all_at(self.device_offset(self.header_size), &data[first..])?;
        }
        Ok(())
    }

    /// Write a logged block to its home location.
    pub(crate) fn device_write(&self, offset: ByteOffset, data: &[u8]) -> Result<()> {
        self.device.write_all_at(offset, data)
    }

    pub(crate) fn write_header(&self, header: &[u8]) -> Result<()> {
        self.device.write_all_at(self.base, header)
    }

    /// Zero the whole transaction area so stale records never replay.
    pub(crate) fn zero(&self) -> Result<()> {
        let chunk = vec![0_u8; ZERO_CHUNK];
        let mut pos = self.header_size;
        while pos < self.size {
            let len = to_usize((self.size - pos).min(ZERO_CHUNK as u64))?;
            self.device
                .write_all_at(self.device_offset(pos), &chunk[..len])?;
            pos += len as u64;
        }
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.device.sync()
    }
}
