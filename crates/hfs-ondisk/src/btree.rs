//! B-tree node descriptor and header record.
//!
//! On disk every field is big-endian. The node engine keeps cached nodes in
//! host order, so both structures parse and encode under an explicit
//! [`Endian`].

use hfs_types::{ParseError, ensure_slice, ensure_slice_mut};
use serde::{Deserialize, Serialize};

/// Size of the descriptor at the start of every node.
pub const NODE_DESCRIPTOR_SIZE: usize = 14;
/// Size of the header record in node 0.
pub const HEADER_RECORD_SIZE: usize = 106;
/// Size of the user-data record following the header record.
pub const USER_DATA_RECORD_SIZE: usize = 128;
/// Offset of the map record in the header node.
pub const HEADER_MAP_RECORD_OFFSET: usize =
    NODE_DESCRIPTOR_SIZE + HEADER_RECORD_SIZE + USER_DATA_RECORD_SIZE;
/// Header node carries header, user-data and map records.
pub const HEADER_NODE_RECORDS: u16 = 3;
/// Bytes of a map node that are not map bits: descriptor, two offsets and
/// two bytes of alignment padding.
pub const MAP_NODE_OVERHEAD: usize = NODE_DESCRIPTOR_SIZE + 2 * 2 + 2;
/// Deepest tree the engine accepts.
pub const MAX_TREE_DEPTH: u16 = 16;

/// `keyCompareType` for case-insensitive (case-folding) catalog order.
pub const KEY_COMPARE_CASE_FOLD: u8 = 0xCF;
/// `keyCompareType` for binary catalog order (HFSX only).
pub const KEY_COMPARE_BINARY: u8 = 0xBC;

/// `btreeType` written for the catalog and extents trees.
pub const BTREE_TYPE_HFS: u8 = 0;
/// `btreeType` written for the attributes tree.
pub const BTREE_TYPE_RESERVED: u8 = 0xFF;

// ── Byte order ─────────────────────────────────────────────────────────────

/// Byte order of a node image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// On-disk order.
    Big,
    /// Host order, the in-memory form of cached nodes.
    Native,
}

impl Endian {
    pub fn read_u16(self, data: &[u8], offset: usize) -> Result<u16, ParseError> {
        let b = ensure_slice(data, offset, 2)?;
        let raw = [b[0], b[1]];
        Ok(match self {
            Self::Big => u16::from_be_bytes(raw),
            Self::Native => u16::from_ne_bytes(raw),
        })
    }

    pub fn read_u32(self, data: &[u8], offset: usize) -> Result<u32, ParseError> {
        let b = ensure_slice(data, offset, 4)?;
        let raw = [b[0], b[1], b[2], b[3]];
        Ok(match self {
            Self::Big => u32::from_be_bytes(raw),
            Self::Native => u32::from_ne_bytes(raw),
        })
    }

    pub fn write_u16(self, data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
        let bytes = match self {
            Self::Big => value.to_be_bytes(),
            Self::Native => value.to_ne_bytes(),
        };
        ensure_slice_mut(data, offset, 2)?.copy_from_slice(&bytes);
        Ok(())
    }

    pub fn write_u32(self, data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
        let bytes = match self {
            Self::Big => value.to_be_bytes(),
            Self::Native => value.to_ne_bytes(),
        };
        ensure_slice_mut(data, offset, 4)?.copy_from_slice(&bytes);
        Ok(())
    }
}

// ── Node descriptor ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Leaf,
    Index,
    Header,
    Map,
}

impl NodeKind {
    #[must_use]
    pub fn from_raw(raw: i8) -> Option<Self> {
        match raw {
            -1 => Some(Self::Leaf),
            0 => Some(Self::Index),
            1 => Some(Self::Header),
            2 => Some(Self::Map),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> i8 {
        match self {
            Self::Leaf => -1,
            Self::Index => 0,
            Self::Header => 1,
            Self::Map => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub forward_link: u32,
    pub backward_link: u32,
    pub kind: NodeKind,
    pub height: u8,
    pub num_records: u16,
}

impl NodeDescriptor {
    pub fn parse(node: &[u8], endian: Endian) -> Result<Self, ParseError> {
        ensure_slice(node, 0, NODE_DESCRIPTOR_SIZE)?;
        let kind = NodeKind::from_raw(i8::from_ne_bytes([node[8]])).ok_or(
            ParseError::InvalidField {
                field: "node_kind",
                reason: "not leaf/index/header/map",
            },
        )?;
        Ok(Self {
            forward_link: endian.read_u32(node, 0)?,
            backward_link: endian.read_u32(node, 4)?,
            kind,
            height: node[9],
            num_records: endian.read_u16(node, 10)?,
        })
    }

    pub fn encode(&self, node: &mut [u8], endian: Endian) -> Result<(), ParseError> {
        ensure_slice(node, 0, NODE_DESCRIPTOR_SIZE)?;
        endian.write_u32(node, 0, self.forward_link)?;
        endian.write_u32(node, 4, self.backward_link)?;
        node[8] = self.kind.to_raw().to_ne_bytes()[0];
        node[9] = self.height;
        endian.write_u16(node, 10, self.num_records)?;
        endian.write_u16(node, 12, 0)
    }
}

// ── Header record ──────────────────────────────────────────────────────────

/// `attributes` of the header record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BTreeAttributes(pub u32);

impl BTreeAttributes {
    pub const BAD_CLOSE: Self = Self(1);
    /// Key length fields are 16-bit.
    pub const BIG_KEYS: Self = Self(2);
    /// Index records carry the actual key length instead of `maxKeyLength`.
    pub const VARIABLE_INDEX_KEYS: Self = Self(4);

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0
    }
}

/// First record of node 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRecord {
    pub tree_depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf_node: u32,
    pub last_leaf_node: u32,
    pub node_size: u16,
    pub max_key_length: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub clump_size: u32,
    pub btree_type: u8,
    pub key_compare_type: u8,
    pub attributes: BTreeAttributes,
}

impl HeaderRecord {
    /// Parse from a whole header node (the record starts after the
    /// descriptor).
    pub fn parse(node: &[u8], endian: Endian) -> Result<Self, ParseError> {
        let base = NODE_DESCRIPTOR_SIZE;
        let rec = ensure_slice(node, base, HEADER_RECORD_SIZE)?;
        Ok(Self {
            tree_depth: endian.read_u16(rec, 0)?,
            root_node: endian.read_u32(rec, 2)?,
            leaf_records: endian.read_u32(rec, 6)?,
            first_leaf_node: endian.read_u32(rec, 10)?,
            last_leaf_node: endian.read_u32(rec, 14)?,
            node_size: endian.read_u16(rec, 18)?,
            max_key_length: endian.read_u16(rec, 20)?,
            total_nodes: endian.read_u32(rec, 22)?,
            free_nodes: endian.read_u32(rec, 26)?,
            clump_size: endian.read_u32(rec, 32)?,
            btree_type: rec[36],
            key_compare_type: rec[37],
            attributes: BTreeAttributes(endian.read_u32(rec, 38)?),
        })
    }

    /// Encode into a whole header node; reserved fields are zeroed.
    pub fn encode(&self, node: &mut [u8], endian: Endian) -> Result<(), ParseError> {
        let rec = ensure_slice_mut(node, NODE_DESCRIPTOR_SIZE, HEADER_RECORD_SIZE)?;
        rec.fill(0);
        endian.write_u16(rec, 0, self.tree_depth)?;
        endian.write_u32(rec, 2, self.root_node)?;
        endian.write_u32(rec, 6, self.leaf_records)?;
        endian.write_u32(rec, 10, self.first_leaf_node)?;
        endian.write_u32(rec, 14, self.last_leaf_node)?;
        endian.write_u16(rec, 18, self.node_size)?;
        endian.write_u16(rec, 20, self.max_key_length)?;
        endian.write_u32(rec, 22, self.total_nodes)?;
        endian.write_u32(rec, 26, self.free_nodes)?;
        endian.write_u32(rec, 32, self.clump_size)?;
        rec[36] = self.btree_type;
        rec[37] = self.key_compare_type;
        endian.write_u32(rec, 38, self.attributes.0)
    }

    /// Structural checks applied when a tree is opened.
    pub fn validate(&self) -> Result<(), ParseError> {
        if hfs_types::NodeSize::new(u32::from(self.node_size)).is_err() {
            return Err(ParseError::InvalidField {
                field: "node_size",
                reason: "must be power of two in 512..=32768",
            });
        }
        if self.tree_depth > MAX_TREE_DEPTH {
            return Err(ParseError::InvalidField {
                field: "tree_depth",
                reason: "deeper than supported",
            });
        }
        if self.free_nodes > self.total_nodes {
            return Err(ParseError::InvalidField {
                field: "free_nodes",
                reason: "exceeds total_nodes",
            });
        }
        if (self.root_node == 0) != (self.tree_depth == 0) {
            return Err(ParseError::InvalidField {
                field: "root_node",
                reason: "root and depth disagree on emptiness",
            });
        }
        if self.root_node >= self.total_nodes && self.root_node != 0 {
            return Err(ParseError::InvalidField {
                field: "root_node",
                reason: "beyond total_nodes",
            });
        }
        Ok(())
    }

    /// Map bits available in the header node's map record.
    #[must_use]
    pub fn header_map_bits(node_size: u16) -> u32 {
        let bytes = usize::from(node_size)
            .saturating_sub(HEADER_MAP_RECORD_OFFSET + 4 * 2);
        u32::try_from(bytes * 8).unwrap_or(u32::MAX)
    }

    /// Map bits carried by one map node.
    #[must_use]
    pub fn map_node_bits(node_size: u16) -> u32 {
        let bytes = usize::from(node_size).saturating_sub(MAP_NODE_OVERHEAD);
        u32::try_from(bytes * 8).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> HeaderRecord {
        HeaderRecord {
            tree_depth: 2,
            root_node: 5,
            leaf_records: 77,
            first_leaf_node: 1,
            last_leaf_node: 9,
            node_size: 4096,
            max_key_length: 516,
            total_nodes: 64,
            free_nodes: 50,
            clump_size: 65536,
            btree_type: BTREE_TYPE_HFS,
            key_compare_type: KEY_COMPARE_CASE_FOLD,
            attributes: BTreeAttributes(
                BTreeAttributes::BIG_KEYS.0 | BTreeAttributes::VARIABLE_INDEX_KEYS.0,
            ),
        }
    }

    #[test]
    fn node_kind_raw_values() {
        for kind in [NodeKind::Leaf, NodeKind::Index, NodeKind::Header, NodeKind::Map] {
            assert_eq!(NodeKind::from_raw(kind.to_raw()), Some(kind));
        }
        assert_eq!(NodeKind::Leaf.to_raw(), -1);
        assert_eq!(NodeKind::from_raw(3), None);
        assert_eq!(NodeKind::from_raw(-2), None);
    }

    #[test]
    fn descriptor_big_endian_layout() {
        let desc = NodeDescriptor {
            forward_link: 0x0102_0304,
            backward_link: 7,
            kind: NodeKind::Leaf,
            height: 1,
            num_records: 0x0A0B,
        };
        let mut node = [0_u8; 512];
        desc.encode(&mut node, Endian::Big).expect("encode");
        assert_eq!(&node[0..4], &[1, 2, 3, 4]);
        assert_eq!(node[8], 0xFF);
        assert_eq!(&node[10..12], &[0x0A, 0x0B]);
        assert_eq!(NodeDescriptor::parse(&node, Endian::Big).expect("parse"), desc);
    }

    #[test]
    fn descriptor_endians_differ_only_in_multibyte_fields() {
        let desc = NodeDescriptor {
            forward_link: 0x1122_3344,
            backward_link: 0,
            kind: NodeKind::Index,
            height: 3,
            num_records: 2,
        };
        let mut big = [0_u8; 14];
        let mut native = [0_u8; 14];
        desc.encode(&mut big, Endian::Big).expect("big");
        desc.encode(&mut native, Endian::Native).expect("native");
        assert_eq!(big[8..10], native[8..10]);
        assert_eq!(NodeDescriptor::parse(&native, Endian::Native).expect("parse"), desc);
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut node = [0_u8; 14];
        node[8] = 9;
        assert!(NodeDescriptor::parse(&node, Endian::Big).is_err());
    }

    #[test]
    fn header_record_offsets() {
        let header = sample_header();
        let mut node = vec![0_u8; 4096];
        header.encode(&mut node, Endian::Big).expect("encode");
        // nodeSize lives at record offset 18
        assert_eq!(&node[14 + 18..14 + 20], &4096_u16.to_be_bytes());
        assert_eq!(node[14 + 37], KEY_COMPARE_CASE_FOLD);
        let parsed = HeaderRecord::parse(&node, Endian::Big).expect("parse");
        assert_eq!(parsed, header);
        assert!(parsed.attributes.contains(BTreeAttributes::VARIABLE_INDEX_KEYS));
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn header_validation_rejects_inconsistent_fields() {
        let mut header = sample_header();
        header.free_nodes = 65;
        assert!(header.validate().is_err());

        let mut header = sample_header();
        header.root_node = 0;
        assert!(header.validate().is_err());

        let mut header = sample_header();
        header.node_size = 1000;
        assert!(header.validate().is_err());

        let mut empty = sample_header();
        empty.root_node = 0;
        empty.tree_depth = 0;
        assert!(empty.validate().is_ok());
    }

    #[test]
    fn map_capacity() {
        // 4096 - 14 - 106 - 128 - 8 = 3840 bytes of map
        assert_eq!(HeaderRecord::header_map_bits(4096), 3840 * 8);
        assert_eq!(HeaderRecord::map_node_bits(4096), (4096 - 20) * 8);
    }
}
