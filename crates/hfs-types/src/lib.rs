#![forbid(unsafe_code)]
//! Unit-carrying newtypes, on-disk constants, and big-endian helpers.
//!
//! HFS+ stores every multi-byte integer big-endian. All parsing in the
//! workspace goes through [`ensure_slice`] so a truncated buffer surfaces as
//! [`ParseError::InsufficientData`] instead of a panic.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Byte offset of the primary volume header from the start of the volume.
pub const VOLUME_HEADER_OFFSET: u64 = 1024;
/// Size of the volume header (and of an HFS master directory block).
pub const VOLUME_HEADER_SIZE: usize = 512;
/// Distance of the alternate header from the end of the volume.
pub const ALTERNATE_HEADER_END_OFFSET: u64 = 1024;

/// `H+`
pub const HFS_PLUS_SIGNATURE: u16 = 0x482B;
/// `HX`
pub const HFSX_SIGNATURE: u16 = 0x4858;
/// `BD`, the legacy HFS master directory block used as a wrapper.
pub const HFS_WRAPPER_SIGNATURE: u16 = 0x4244;
pub const HFS_PLUS_VERSION: u16 = 4;
pub const HFSX_VERSION: u16 = 5;

/// Sector size used by wrapper arithmetic and header placement.
pub const SECTOR_SIZE: u64 = 512;

/// `lastMountedVersion` written by a journaled mount.
pub const LAST_MOUNTED_JOURNALED: u32 = u32::from_be_bytes(*b"HFSJ");
/// `lastMountedVersion` written by a non-journaled mount.
pub const LAST_MOUNTED_PLAIN: u32 = u32::from_be_bytes(*b"10.0");
/// `lastMountedVersion` left behind when journal open or replay failed.
pub const LAST_MOUNTED_FSCK: u32 = u32::from_be_bytes(*b"FSK!");

// ── Newtypes ────────────────────────────────────────────────────────────────

/// Allocation block number (HFS+ addresses volumes in 32-bit blocks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u32);

/// B-tree node number within a tree file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeNumber(pub u32);

impl NodeNumber {
    pub const HEADER: Self = Self(0);
}

/// Catalog node ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cnid(pub u32);

impl Cnid {
    pub const ROOT_PARENT: Self = Self(1);
    pub const ROOT_FOLDER: Self = Self(2);
    pub const EXTENTS_FILE: Self = Self(3);
    pub const CATALOG_FILE: Self = Self(4);
    pub const BAD_BLOCKS_FILE: Self = Self(5);
    pub const ALLOCATION_FILE: Self = Self(6);
    pub const STARTUP_FILE: Self = Self(7);
    pub const ATTRIBUTES_FILE: Self = Self(8);
    pub const REPAIR_CATALOG_FILE: Self = Self(14);
    pub const BOGUS_EXTENT_FILE: Self = Self(15);
    pub const FIRST_USER: Self = Self(16);

    /// True for the reserved IDs below [`Cnid::FIRST_USER`].
    #[must_use]
    pub fn is_reserved(self) -> bool {
        self.0 < Self::FIRST_USER.0
    }
}

/// Identity of the file a cached buffer belongs to.
///
/// System files use their CNID. [`FileId::DEVICE`] addresses raw device
/// sectors (volume headers, the journal region).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId(pub u32);

impl FileId {
    pub const DEVICE: Self = Self(0);
    pub const EXTENTS: Self = Self(Cnid::EXTENTS_FILE.0);
    pub const CATALOG: Self = Self(Cnid::CATALOG_FILE.0);
    pub const ALLOCATION: Self = Self(Cnid::ALLOCATION_FILE.0);
    pub const STARTUP: Self = Self(Cnid::STARTUP_FILE.0);
    pub const ATTRIBUTES: Self = Self(Cnid::ATTRIBUTES_FILE.0);
}

impl From<Cnid> for FileId {
    fn from(cnid: Cnid) -> Self {
        Self(cnid.0)
    }
}

/// Byte offset on a `ByteDevice` (pread/pwrite semantics).
///
/// This is a unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Subtract a byte count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }
}

/// Validated allocation block size (power of two, at least one sector).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 1 MiB].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(512..=1 << 20).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=1048576",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    /// Byte length of `blocks` allocation blocks.
    #[must_use]
    pub fn blocks_to_bytes(self, blocks: u32) -> u64 {
        u64::from(blocks) * u64::from(self.0)
    }

    /// Number of whole blocks needed to hold `bytes` (rounding up).
    #[must_use]
    pub fn bytes_to_blocks_ceil(self, bytes: u64) -> u64 {
        bytes.div_ceil(u64::from(self.0))
    }
}

/// Validated B-tree node size (power of two in 512..=32768).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeSize(u16);

impl NodeSize {
    pub const MIN: u16 = 512;
    pub const MAX: u16 = 32768;

    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(u32::from(Self::MIN)..=u32::from(Self::MAX)).contains(&value)
        {
            return Err(ParseError::InvalidField {
                field: "node_size",
                reason: "must be power of two in 512..=32768",
            });
        }
        let narrow = u16::try_from(value).map_err(|_| ParseError::IntegerConversion {
            field: "node_size",
        })?;
        Ok(Self(narrow))
    }

    #[must_use]
    pub fn get(self) -> u16 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        usize::from(self.0)
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Cnid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::DEVICE {
            f.write_str("device")
        } else {
            write!(f, "file#{}", self.0)
        }
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    let actual = data.len();
    if end > actual {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: actual.saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_u8(data: &mut [u8], offset: usize, value: u8) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 1)?[0] = value;
    Ok(())
}

#[inline]
pub fn write_be_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[inline]
pub fn write_be_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[inline]
pub fn write_be_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

/// Round `value` down to a multiple of `align` (`align` must be non-zero).
#[must_use]
pub fn align_down(value: u64, align: u64) -> u64 {
    value - value % align
}
