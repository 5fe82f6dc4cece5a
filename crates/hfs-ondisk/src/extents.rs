//! Extents-overflow keys and records.

use crate::volume::{EXTENT_DENSITY, EXTENT_RECORD_SIZE, ExtentDescriptor, encode_extent_record, parse_extent_record};
use hfs_types::{Cnid, ParseError, read_be_u16, read_be_u32};
use serde::{Deserialize, Serialize};

/// `keyLength` of every extents key.
pub const EXTENT_KEY_LENGTH: u16 = 10;
/// Encoded key size including the length field.
pub const EXTENT_KEY_SIZE: usize = 12;

pub const FORK_DATA: u8 = 0x00;
pub const FORK_RESOURCE: u8 = 0xFF;

/// `(forkType, fileID, startBlock)` key of the extents tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtentKey {
    pub fork_type: u8,
    pub file_id: Cnid,
    /// First file allocation block covered by the record.
    pub start_block: u32,
}

impl ExtentKey {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if read_be_u16(data, 0)? != EXTENT_KEY_LENGTH {
            return Err(ParseError::InvalidField {
                field: "extent_key_length",
                reason: "must be 10",
            });
        }
        Ok(Self {
            fork_type: hfs_types::read_u8(data, 2)?,
            file_id: Cnid(read_be_u32(data, 4)?),
            start_block: read_be_u32(data, 8)?,
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; EXTENT_KEY_SIZE] {
        let mut out = [0_u8; EXTENT_KEY_SIZE];
        out[0..2].copy_from_slice(&EXTENT_KEY_LENGTH.to_be_bytes());
        out[2] = self.fork_type;
        out[4..8].copy_from_slice(&self.file_id.0.to_be_bytes());
        out[8..12].copy_from_slice(&self.start_block.to_be_bytes());
        out
    }
}

/// Eight more extents of a fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtentRecord(pub [ExtentDescriptor; EXTENT_DENSITY]);

impl ExtentRecord {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self(parse_extent_record(data, 0)?))
    }

    pub fn encode(&self) -> Result<[u8; EXTENT_RECORD_SIZE], ParseError> {
        let mut out = [0_u8; EXTENT_RECORD_SIZE];
        encode_extent_record(&self.0, &mut out, 0)?;
        Ok(out)
    }

    #[must_use]
    pub fn blocks(&self) -> u64 {
        self.0.iter().map(|e| u64::from(e.block_count)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let key = ExtentKey {
            fork_type: FORK_RESOURCE,
            file_id: Cnid(0x0102_0304),
            start_block: 16,
        };
        let bytes = key.encode();
        assert_eq!(bytes[..4], [0, 10, 0xFF, 0]);
        assert_eq!(bytes[4..8], [1, 2, 3, 4]);
        assert_eq!(ExtentKey::parse(&bytes).expect("parse"), key);
    }

    #[test]
    fn bad_key_length_rejected() {
        let mut bytes = ExtentKey {
            fork_type: FORK_DATA,
            file_id: Cnid(4),
            start_block: 0,
        }
        .encode();
        bytes[1] = 8;
        assert!(ExtentKey::parse(&bytes).is_err());
    }

    #[test]
    fn record_counts_blocks() {
        let mut rec = ExtentRecord::default();
        rec.0[0] = ExtentDescriptor::new(100, 4);
        rec.0[1] = ExtentDescriptor::new(300, 6);
        let bytes = rec.encode().expect("encode");
        let parsed = ExtentRecord::parse(&bytes).expect("parse");
        assert_eq!(parsed.blocks(), 10);
    }
}
