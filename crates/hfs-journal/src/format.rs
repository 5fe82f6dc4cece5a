//! On-disk journal records.
//!
//! ```text
//! Journal header (first `header_size` bytes of the journal):
//! +------------------+--------+
//! | magic            | 4 bytes| = 0x4A4E_4C78
//! | endian           | 4 bytes| = 0x1234_5678 in the writer's byte order
//! | start            | 8 bytes| ring offset of the oldest live transaction
//! | end              | 8 bytes| ring offset past the newest known transaction
//! | size             | 8 bytes| journal size, header included
//! | block_size       | 4 bytes|
//! | checksum         | 4 bytes| CRC32c of bytes 0..48, this field zeroed
//! | header_size      | 4 bytes|
//! | sequence         | 4 bytes| sequence of the transaction at `start`
//! +------------------+--------+
//!
//! Transaction record (each part padded to `block_size`):
//! +------------------+
//! | block list       |  magic, count, sequence, checksum, bytes_used,
//! |                  |  then count x (dev_offset u64, len u32, reserved u32)
//! +------------------+
//! | payload 0..count |  raw block contents in list order
//! +------------------+
//! | commit           |  magic, sequence, count, checksum, bytes_used,
//! |                  |  CRC32c over block list and payloads
//! +------------------+
//! ```
//!
//! Writers always use big-endian. Readers accept either order, detected
//! from the header's endian marker, and read every record of that journal
//! in the same order.

use hfs_types::{ParseError, read_fixed};
use thiserror::Error;

pub const JOURNAL_HEADER_MAGIC: u32 = 0x4A4E_4C78;
pub const JOURNAL_ENDIAN_MARKER: u32 = 0x1234_5678;
pub const BLOCK_LIST_MAGIC: u32 = 0x4A54_5842;
pub const COMMIT_MAGIC: u32 = 0x4A43_4D54;

/// Meaningful bytes at the start of the header block.
pub const JOURNAL_HEADER_LEN: usize = 48;
pub const BLOCK_LIST_FIXED_LEN: usize = 32;
pub const BLOCK_INFO_LEN: usize = 16;
pub const COMMIT_LEN: usize = 32;

const HEADER_CHECKSUM_OFFSET: usize = 36;
const BLOCK_LIST_CHECKSUM_OFFSET: usize = 12;
const COMMIT_CHECKSUM_OFFSET: usize = 12;

/// Why a journal structure was rejected.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("{what} magic mismatch: {found:#010x}")]
    BadMagic { what: &'static str, found: u32 },
    #[error("{what} checksum mismatch")]
    Checksum { what: &'static str },
    #[error("sequence {found}, expected {expected}")]
    Sequence { expected: u32, found: u32 },
    #[error("bad length: {0}")]
    Length(&'static str),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    fn get_u32(self, data: &[u8], offset: usize) -> Result<u32, ParseError> {
        let raw = read_fixed::<4>(data, offset)?;
        Ok(match self {
            Self::Big => u32::from_be_bytes(raw),
            Self::Little => u32::from_le_bytes(raw),
        })
    }

    fn get_u64(self, data: &[u8], offset: usize) -> Result<u64, ParseError> {
        let raw = read_fixed::<8>(data, offset)?;
        Ok(match self {
            Self::Big => u64::from_be_bytes(raw),
            Self::Little => u64::from_le_bytes(raw),
        })
    }

    fn put_u32(self, out: &mut [u8], offset: usize, value: u32) {
        let raw = match self {
            Self::Big => value.to_be_bytes(),
            Self::Little => value.to_le_bytes(),
        };
        out[offset..offset + 4].copy_from_slice(&raw);
    }

    fn put_u64(self, out: &mut [u8], offset: usize, value: u64) {
        let raw = match self {
            Self::Big => value.to_be_bytes(),
            Self::Little => value.to_le_bytes(),
        };
        out[offset..offset + 8].copy_from_slice(&raw);
    }
}

/// Round `len` up to a multiple of `block_size`.
#[must_use]
pub fn pad_to(len: u64, block_size: u64) -> u64 {
    len.div_ceil(block_size) * block_size
}

fn checksum_with_zeroed(data: &[u8], field: usize) -> u32 {
    let mut copy = data.to_vec();
    copy[field..field + 4].fill(0);
    crc32c::crc32c(&copy)
}

// ── Header ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub block_size: u32,
    pub header_size: u32,
    pub sequence: u32,
}

impl JournalHeader {
    /// Header block of `header_size` bytes in `order`.
    #[must_use]
    pub fn encode(&self, order: ByteOrder) -> Vec<u8> {
        let len = usize::try_from(self.header_size)
            .unwrap_or(JOURNAL_HEADER_LEN)
            .max(JOURNAL_HEADER_LEN);
        let mut out = vec![0_u8; len];
        order.put_u32(&mut out, 0, JOURNAL_HEADER_MAGIC);
        order.put_u32(&mut out, 4, JOURNAL_ENDIAN_MARKER);
        order.put_u64(&mut out, 8, self.start);
        order.put_u64(&mut out, 16, self.end);
        order.put_u64(&mut out, 24, self.size);
        order.put_u32(&mut out, 32, self.block_size);
        order.put_u32(&mut out, 40, self.header_size);
        order.put_u32(&mut out, 44, self.sequence);
        let checksum = checksum_with_zeroed(&out[..JOURNAL_HEADER_LEN], HEADER_CHECKSUM_OFFSET);
        order.put_u32(&mut out, HEADER_CHECKSUM_OFFSET, checksum);
        out
    }

    /// Parse a header, detecting the writer's byte order.
    pub fn decode(data: &[u8]) -> Result<(Self, ByteOrder), RecordError> {
        let order = if ByteOrder::Big.get_u32(data, 0)? == JOURNAL_HEADER_MAGIC {
            ByteOrder::Big
        } else if ByteOrder::Little.get_u32(data, 0)? == JOURNAL_HEADER_MAGIC {
            ByteOrder::Little
        } else {
            return Err(RecordError::BadMagic {
                what: "journal header",
                found: ByteOrder::Big.get_u32(data, 0)?,
            });
        };
        let marker = order.get_u32(data, 4)?;
        if marker != JOURNAL_ENDIAN_MARKER {
            return Err(RecordError::BadMagic {
                what: "journal endian marker",
                found: marker,
            });
        }
        let stored = order.get_u32(data, HEADER_CHECKSUM_OFFSET)?;
        let fixed = hfs_types::ensure_slice(data, 0, JOURNAL_HEADER_LEN)?;
        if checksum_with_zeroed(fixed, HEADER_CHECKSUM_OFFSET) != stored {
            return Err(RecordError::Checksum {
                what: "journal header",
            });
        }
        let header = Self {
            start: order.get_u64(data, 8)?,
            end: order.get_u64(data, 16)?,
            size: order.get_u64(data, 24)?,
            block_size: order.get_u32(data, 32)?,
            header_size: order.get_u32(data, 40)?,
            sequence: order.get_u32(data, 44)?,
        };
        Ok((header, order))
    }
}

// ── Block list ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Home location of the block on the device.
    pub dev_offset: u64,
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockList {
    pub sequence: u32,
    /// Length of the whole transaction record, commit block included.
    pub bytes_used: u64,
    pub blocks: Vec<BlockInfo>,
}

impl BlockList {
    #[must_use]
    pub fn encoded_len(count: usize, block_size: u64) -> u64 {
        pad_to((BLOCK_LIST_FIXED_LEN + count * BLOCK_INFO_LEN) as u64, block_size)
    }

    fn meaningful_len(count: usize) -> usize {
        BLOCK_LIST_FIXED_LEN + count * BLOCK_INFO_LEN
    }

    pub fn encode(&self, block_size: u64, order: ByteOrder) -> Result<Vec<u8>, RecordError> {
        let count = u32::try_from(self.blocks.len())
            .map_err(|_| RecordError::Length("too many blocks"))?;
        let len = usize::try_from(Self::encoded_len(self.blocks.len(), block_size))
            .map_err(|_| RecordError::Length("block list"))?;
        let mut out = vec![0_u8; len];
        order.put_u32(&mut out, 0, BLOCK_LIST_MAGIC);
        order.put_u32(&mut out, 4, count);
        order.put_u32(&mut out, 8, self.sequence);
        order.put_u64(&mut out, 16, self.bytes_used);
        for (i, info) in self.blocks.iter().enumerate() {
            let at = BLOCK_LIST_FIXED_LEN + i * BLOCK_INFO_LEN;
            order.put_u64(&mut out, at, info.dev_offset);
            order.put_u32(&mut out, at + 8, info.len);
        }
        let meaningful = Self::meaningful_len(self.blocks.len());
        let checksum = checksum_with_zeroed(&out[..meaningful], BLOCK_LIST_CHECKSUM_OFFSET);
        order.put_u32(&mut out, BLOCK_LIST_CHECKSUM_OFFSET, checksum);
        Ok(out)
    }

    /// Block count from the first journal block of a record.
    pub fn peek_count(data: &[u8], order: ByteOrder) -> Result<usize, RecordError> {
        let magic = order.get_u32(data, 0)?;
        if magic != BLOCK_LIST_MAGIC {
            return Err(RecordError::BadMagic {
                what: "block list",
                found: magic,
            });
        }
        let count = order.get_u32(data, 4)?;
        usize::try_from(count).map_err(|_| RecordError::Length("block count"))
    }

    pub fn decode(data: &[u8], order: ByteOrder) -> Result<Self, RecordError> {
        let count = Self::peek_count(data, order)?;
        let meaningful = hfs_types::ensure_slice(data, 0, Self::meaningful_len(count))?;
        let stored = order.get_u32(data, BLOCK_LIST_CHECKSUM_OFFSET)?;
        if checksum_with_zeroed(meaningful, BLOCK_LIST_CHECKSUM_OFFSET) != stored {
            return Err(RecordError::Checksum { what: "block list" });
        }
        let mut blocks = Vec::with_capacity(count);
        for i in 0..count {
            let at = BLOCK_LIST_FIXED_LEN + i * BLOCK_INFO_LEN;
            blocks.push(BlockInfo {
                dev_offset: order.get_u64(data, at)?,
                len: order.get_u32(data, at + 8)?,
            });
        }
        Ok(Self {
            sequence: order.get_u32(data, 8)?,
            bytes_used: order.get_u64(data, 16)?,
            blocks,
        })
    }
}

// ── Commit ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitRecord {
    pub sequence: u32,
    pub num_blocks: u32,
    pub bytes_used: u64,
    /// CRC32c over the padded block list and payloads.
    pub data_checksum: u32,
}

impl CommitRecord {
    #[must_use]
    pub fn encode(&self, block_size: u64, order: ByteOrder) -> Vec<u8> {
        let len = usize::try_from(pad_to(COMMIT_LEN as u64, block_size)).unwrap_or(COMMIT_LEN);
        let mut out = vec![0_u8; len];
        order.put_u32(&mut out, 0, COMMIT_MAGIC);
        order.put_u32(&mut out, 4, self.sequence);
        order.put_u32(&mut out, 8, self.num_blocks);
        order.put_u64(&mut out, 16, self.bytes_used);
        order.put_u32(&mut out, 24, self.data_checksum);
        let checksum = checksum_with_zeroed(&out[..COMMIT_LEN], COMMIT_CHECKSUM_OFFSET);
        order.put_u32(&mut out, COMMIT_CHECKSUM_OFFSET, checksum);
        out
    }

    pub fn decode(data: &[u8], order: ByteOrder) -> Result<Self, RecordError> {
        let magic = order.get_u32(data, 0)?;
        if magic != COMMIT_MAGIC {
            return Err(RecordError::BadMagic {
                what: "commit",
                found: magic,
            });
        }
        let fixed = hfs_types::ensure_slice(data, 0, COMMIT_LEN)?;
        let stored = order.get_u32(data, COMMIT_CHECKSUM_OFFSET)?;
        if checksum_with_zeroed(fixed, COMMIT_CHECKSUM_OFFSET) != stored {
            return Err(RecordError::Checksum { what: "commit" });
        }
        Ok(Self {
            sequence: order.get_u32(data, 4)?,
            num_blocks: order.get_u32(data, 8)?,
            bytes_used: order.get_u64(data, 16)?,
            data_checksum: order.get_u32(data, 24)?,
        })
    }
}

/// Length of the record [`encode_transaction`] produces.
#[must_use]
pub fn transaction_len(payload_lens: &[usize], block_size: u64) -> u64 {
    let payloads: u64 = payload_lens
        .iter()
        .map(|len| pad_to(*len as u64, block_size))
        .sum();
    BlockList::encoded_len(payload_lens.len(), block_size)
        + payloads
        + pad_to(COMMIT_LEN as u64, block_size)
}

/// Lay out one transaction record: block list, padded payloads, commit.
pub fn encode_transaction(
    sequence: u32,
    blocks: &[(u64, &[u8])],
    block_size: u64,
    order: ByteOrder,
) -> Result<Vec<u8>, RecordError> {
    let lens: Vec<usize> = blocks.iter().map(|(_, data)| data.len()).collect();
    let bytes_used = transaction_len(&lens, block_size);
    let infos = blocks
        .iter()
        .map(|(dev_offset, data)| {
            Ok(BlockInfo {
                dev_offset: *dev_offset,
                len: u32::try_from(data.len()).map_err(|_| RecordError::Length("payload"))?,
            })
        })
        .collect::<Result<Vec<_>, RecordError>>()?;
    let list = BlockList {
        sequence,
        bytes_used,
        blocks: infos,
    };

    let mut out = list.encode(block_size, order)?;
    for (_, data) in blocks {
        out.extend_from_slice(data);
        let padded = usize::try_from(pad_to(out.len() as u64, block_size))
            .map_err(|_| RecordError::Length("payload"))?;
        out.resize(padded, 0);
    }
    let commit = CommitRecord {
        sequence,
        num_blocks: u32::try_from(blocks.len()).map_err(|_| RecordError::Length("count"))?,
        bytes_used,
        data_checksum: crc32c::crc32c(&out),
    };
    out.extend_from_slice(&commit.encode(block_size, order));
    Ok(out)
}
