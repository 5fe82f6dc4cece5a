//! Attributes-tree keys and records.

use crate::volume::{EXTENT_DENSITY, ExtentDescriptor, ForkData, encode_extent_record, parse_extent_record};
use hfs_types::{Cnid, ParseError, ensure_slice, read_be_u16, read_be_u32, write_be_u32};
use serde::{Deserialize, Serialize};

/// Longest attribute name in UTF-16 units.
pub const MAX_ATTR_NAME_UNITS: usize = 127;
/// `keyLength` of the largest attribute key.
pub const ATTR_KEY_MAX_LENGTH: u16 = 12 + 2 * 127;
pub const ATTR_KEY_MIN_LENGTH: u16 = 12;

pub const ATTR_INLINE_DATA: u32 = 0x10;
pub const ATTR_FORK_DATA: u32 = 0x20;
pub const ATTR_EXTENTS: u32 = 0x30;

/// Header bytes of an inline-data record before the payload.
pub const ATTR_INLINE_HEADER_SIZE: usize = 16;
pub const ATTR_FORK_RECORD_SIZE: usize = 88;
pub const ATTR_EXTENTS_RECORD_SIZE: usize = 72;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeKey {
    pub file_id: Cnid,
    pub start_block: u32,
    pub name: Vec<u16>,
}

impl AttributeKey {
    pub fn new(file_id: Cnid, name: &str) -> Result<Self, ParseError> {
        let name: Vec<u16> = name.encode_utf16().collect();
        if name.len() > MAX_ATTR_NAME_UNITS {
            return Err(ParseError::InvalidField {
                field: "attr_name",
                reason: "longer than 127 UTF-16 units",
            });
        }
        Ok(Self {
            file_id,
            start_block: 0,
            name,
        })
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let key_len = read_be_u16(data, 0)?;
        if !(ATTR_KEY_MIN_LENGTH..=ATTR_KEY_MAX_LENGTH).contains(&key_len) {
            return Err(ParseError::InvalidField {
                field: "attr_key_length",
                reason: "out of range",
            });
        }
        let name_len = usize::from(read_be_u16(data, 12)?);
        if 12 + 2 * name_len != usize::from(key_len) {
            return Err(ParseError::InvalidField {
                field: "attr_key_length",
                reason: "does not match name length",
            });
        }
        let body = ensure_slice(data, 14, 2 * name_len)?;
        Ok(Self {
            file_id: Cnid(read_be_u32(data, 4)?),
            start_block: read_be_u32(data, 8)?,
            name: body
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect(),
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let name_len = u16::try_from(self.name.len()).unwrap_or(u16::MAX);
        let key_len = 12 + 2 * name_len;
        let mut out = Vec::with_capacity(2 + usize::from(key_len));
        out.extend_from_slice(&key_len.to_be_bytes());
        out.extend_from_slice(&0_u16.to_be_bytes());
        out.extend_from_slice(&self.file_id.0.to_be_bytes());
        out.extend_from_slice(&self.start_block.to_be_bytes());
        out.extend_from_slice(&name_len.to_be_bytes());
        for unit in &self.name {
            out.extend_from_slice(&unit.to_be_bytes());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeRecord {
    Inline(Vec<u8>),
    Fork(ForkData),
    Extents([ExtentDescriptor; EXTENT_DENSITY]),
}

impl AttributeRecord {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        match read_be_u32(data, 0)? {
            ATTR_INLINE_DATA => {
                let size = usize::try_from(read_be_u32(data, 12)?).map_err(|_| {
                    ParseError::IntegerConversion { field: "attr_size" }
                })?;
                Ok(Self::Inline(
                    ensure_slice(data, ATTR_INLINE_HEADER_SIZE, size)?.to_vec(),
                ))
            }
            ATTR_FORK_DATA => Ok(Self::Fork(ForkData::parse(data, 8)?)),
            ATTR_EXTENTS => Ok(Self::Extents(parse_extent_record(data, 8)?)),
            _ => Err(ParseError::InvalidField {
                field: "attr_record_type",
                reason: "unknown record type",
            }),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        match self {
            Self::Inline(payload) => {
                let size = u32::try_from(payload.len())
                    .map_err(|_| ParseError::IntegerConversion { field: "attr_size" })?;
                // records stay 2-byte aligned inside nodes
                let padded = (ATTR_INLINE_HEADER_SIZE + payload.len() + 1) & !1;
                let mut out = vec![0_u8; padded];
                write_be_u32(&mut out, 0, ATTR_INLINE_DATA)?;
                write_be_u32(&mut out, 12, size)?;
                out[ATTR_INLINE_HEADER_SIZE..ATTR_INLINE_HEADER_SIZE + payload.len()]
                    .copy_from_slice(payload);
                Ok(out)
            }
            Self::Fork(fork) => {
                let mut out = vec![0_u8; ATTR_FORK_RECORD_SIZE];
                write_be_u32(&mut out, 0, ATTR_FORK_DATA)?;
                fork.encode(&mut out, 8)?;
                Ok(out)
            }
            Self::Extents(extents) => {
                let mut out = vec![0_u8; ATTR_EXTENTS_RECORD_SIZE];
                write_be_u32(&mut out, 0, ATTR_EXTENTS)?;
                encode_extent_record(extents, &mut out, 8)?;
                Ok(out)
            }
        }
    }
}
