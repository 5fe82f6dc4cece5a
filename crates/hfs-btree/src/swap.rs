//! Node byte-order conversion.
//!
//! Cached nodes hold the fields the engine reads in host order:
//!
//! | Node kind | Converted fields |
//! |-----------|------------------|
//! | all | descriptor links, record count, offset table |
//! | header | every field of the header record |
//! | index | key length and child pointer of each record |
//! | leaf | key length of each record |
//! | map | nothing beyond the descriptor |
//!
//! Key bodies, leaf payloads, the user-data record and map bits stay in
//! disk order; the typed parsers in `hfs_ondisk` read them directly.
//!
//! A conversion validates the node as it goes. When it fails part of the
//! node may already be converted, so the caller must drop the cached copy.

use hfs_block::NodeFinisher;
use hfs_error::HfsError;
use hfs_ondisk::btree::{HEADER_NODE_RECORDS, MAX_TREE_DEPTH};
use hfs_ondisk::{Endian, HEADER_RECORD_SIZE, NODE_DESCRIPTOR_SIZE, NodeDescriptor, NodeKind};
use hfs_types::FileId;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapDirection {
    BigToHost,
    HostToBig,
    /// Convert only the header record of node 0. The descriptor, offsets
    /// and other records are left as read, because a read made before the
    /// node size is known may hold only part of the node.
    HeaderRecordOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SwapError(pub String);

fn bad(detail: impl Into<String>) -> SwapError {
    SwapError(detail.into())
}

fn swap_u16(node: &mut [u8], at: usize) -> Result<(), SwapError> {
    let field = node
        .get_mut(at..at + 2)
        .ok_or_else(|| bad(format!("16-bit field at {at} past node end")))?;
    let value = u16::from_be_bytes([field[0], field[1]]);
    field.copy_from_slice(&value.to_ne_bytes());
    Ok(())
}

fn swap_u32(node: &mut [u8], at: usize) -> Result<(), SwapError> {
    let field = node
        .get_mut(at..at + 4)
        .ok_or_else(|| bad(format!("32-bit field at {at} past node end")))?;
    let value = u32::from_be_bytes([field[0], field[1], field[2], field[3]]);
    field.copy_from_slice(&value.to_ne_bytes());
    Ok(())
}

/// 16-bit fields of the header record, relative to its start.
const HEADER_U16_FIELDS: [usize; 4] = [0, 18, 20, 30];
/// 32-bit fields of the header record before the reserved tail.
const HEADER_U32_FIELDS: [usize; 8] = [2, 6, 10, 14, 22, 26, 32, 38];
/// `reserved3`: sixteen 32-bit words.
const HEADER_RESERVED_START: usize = 42;

fn swap_header_record(node: &mut [u8]) -> Result<(), SwapError> {
    if node.len() < NODE_DESCRIPTOR_SIZE + HEADER_RECORD_SIZE {
        return Err(bad("header node shorter than its header record"));
    }
    let base = NODE_DESCRIPTOR_SIZE;
    for at in HEADER_U16_FIELDS {
        swap_u16(node, base + at)?;
    }
    for at in HEADER_U32_FIELDS {
        swap_u32(node, base + at)?;
    }
    for at in (HEADER_RESERVED_START..HEADER_RECORD_SIZE).step_by(4) {
        swap_u32(node, base + at)?;
    }
    Ok(())
}

/// Bytes a key of `key_len` occupies, length field and pad included.
#[must_use]
pub(crate) fn key_span(key_len: usize) -> usize {
    (2 + key_len + 1) & !1
}

fn check_shape(desc: &NodeDescriptor) -> Result<(), SwapError> {
    let ok = match desc.kind {
        NodeKind::Leaf => desc.height == 1,
        NodeKind::Index => desc.height > 1 && u16::from(desc.height) <= MAX_TREE_DEPTH,
        NodeKind::Header => desc.height == 0 && desc.num_records == HEADER_NODE_RECORDS,
        NodeKind::Map => desc.height == 0 && desc.num_records >= 1,
    };
    if ok {
        Ok(())
    } else {
        Err(bad(format!(
            "{:?} node with height {} and {} records",
            desc.kind, desc.height, desc.num_records
        )))
    }
}

/// Convert `node` in place.
///
/// `allow_empty` accepts an all-zero node (never written, or cleared
/// before reuse) without validating it.
pub fn swap_node(
    node: &mut [u8],
    direction: SwapDirection,
    allow_empty: bool,
) -> Result<(), SwapError> {
    let size = node.len();
    if size < NODE_DESCRIPTOR_SIZE + 2 {
        return Err(bad(format!("node of {size} bytes")));
    }
    if direction == SwapDirection::HeaderRecordOnly {
        if NodeKind::from_raw(i8::from_ne_bytes([node[8]])) != Some(NodeKind::Header) {
            return Err(bad("header-only conversion of a non-header node"));
        }
        return swap_header_record(node);
    }

    let order = match direction {
        SwapDirection::BigToHost => Endian::Big,
        _ => Endian::Native,
    };
    let parse = |e: hfs_types::ParseError| bad(e.to_string());
    let desc = NodeDescriptor::parse(node, order).map_err(parse)?;
    let count = usize::from(desc.num_records);
    let free_slot = size - 2;

    if allow_empty && count == 0 && order.read_u16(node, free_slot).map_err(parse)? == 0 {
        for at in [0, 4] {
            swap_u32(node, at)?;
        }
        for at in [10, 12, free_slot] {
            swap_u16(node, at)?;
        }
        return Ok(());
    }

    let table = 2 * (count + 1);
    if NODE_DESCRIPTOR_SIZE + table > size {
        return Err(bad(format!("{count} records overflow a {size}-byte node")));
    }
    check_shape(&desc)?;

    let mut offsets = Vec::with_capacity(count + 1);
    for i in 0..=count {
        offsets.push(usize::from(order.read_u16(node, size - 2 * (i + 1)).map_err(parse)?));
    }
    if offsets[0] != NODE_DESCRIPTOR_SIZE {
        return Err(bad(format!("first record at {}", offsets[0])));
    }
    for (i, pair) in offsets.windows(2).enumerate() {
        if pair[1] <= pair[0] {
            return Err(bad(format!("record {i} offsets not increasing")));
        }
        if pair[1] % 2 != 0 {
            return Err(bad(format!("odd record offset {}", pair[1])));
        }
    }
    if offsets[count] > size - table {
        return Err(bad("records overlap the offset table"));
    }

    match desc.kind {
        NodeKind::Leaf | NodeKind::Index => {
            let child = if desc.kind == NodeKind::Index { 4 } else { 0 };
            for i in 0..count {
                let start = offsets[i];
                let key_len = usize::from(order.read_u16(node, start).map_err(parse)?);
                let span = key_span(key_len);
                if span + child > offsets[i + 1] - start {
                    return Err(bad(format!(
                        "record {i} key length {key_len} overruns its record"
                    )));
                }
                swap_u16(node, start)?;
                if child > 0 {
                    swap_u32(node, start + span)?;
                }
            }
        }
        NodeKind::Header => swap_header_record(node)?,
        NodeKind::Map => {}
    }

    for at in [0, 4] {
        swap_u32(node, at)?;
    }
    for at in [10, 12] {
        swap_u16(node, at)?;
    }
    for i in 0..=count {
        swap_u16(node, size - 2 * (i + 1))?;
    }
    Ok(())
}

/// Order of an idle node judged by its first record offset, which is 14 in
/// every valid node. `None` for nodes that were never written.
#[must_use]
pub fn detect_order(node: &[u8]) -> Option<Endian> {
    let size = node.len();
    if size < 2 {
        return None;
    }
    let tail = [node[size - 2], node[size - 1]];
    let first = u16::try_from(NODE_DESCRIPTOR_SIZE).unwrap_or(14);
    if u16::from_ne_bytes(tail) == first {
        Some(Endian::Native)
    } else if u16::from_be_bytes(tail) == first {
        Some(Endian::Big)
    } else {
        None
    }
}

/// Journal and cache finisher that puts a node back in disk order.
#[derive(Debug, Clone, Copy)]
pub struct NodeSwapper {
    file: FileId,
}

impl NodeSwapper {
    #[must_use]
    pub fn new(file: FileId) -> Self {
        Self { file }
    }
}

impl NodeFinisher for NodeSwapper {
    fn finish(&self, data: &mut [u8]) -> hfs_error::Result<()> {
        swap_node(data, SwapDirection::HostToBig, true).map_err(|err| {
            error!(target: "hfs::btree", file = %self.file, %err, "btree_write_corrupt_node");
            HfsError::Corruption {
                block: 0,
                detail: format!("b-tree {} node rejected before write: {err}", self.file),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfs_ondisk::HeaderRecord;
    use proptest::prelude::*;

    const SIZE: usize = 512;

    fn put16(node: &mut [u8], at: usize, v: u16) {
        node[at..at + 2].copy_from_slice(&v.to_be_bytes());
    }

    fn put32(node: &mut [u8], at: usize, v: u32) {
        node[at..at + 4].copy_from_slice(&v.to_be_bytes());
    }

    /// Disk-order leaf with two records of 4-byte keys and 6-byte payloads.
    fn disk_leaf() -> Vec<u8> {
        let mut node = vec![0_u8; SIZE];
        put32(&mut node, 0, 9);
        node[8] = NodeKind::Leaf.to_raw().to_ne_bytes()[0];
        node[9] = 1;
        put16(&mut node, 10, 2);
        for (start, tag) in [(14_usize, 0_u32), (26, 1)] {
            put16(&mut node, start, 4);
            put32(&mut node, start + 2, 0x0A0B_0C00 + tag);
            node[start + 6..start + 12].copy_from_slice(b"abcdef");
        }
        put16(&mut node, SIZE - 2, 14);
        put16(&mut node, SIZE - 4, 26);
        put16(&mut node, SIZE - 6, 38);
        node
    }

    /// Disk-order node of `kind` holding `records` back to back.
    fn disk_node(kind: NodeKind, height: u8, records: &[Vec<u8>]) -> Vec<u8> {
        let mut node = vec![0_u8; SIZE];
        put32(&mut node, 0, 9);
        put32(&mut node, 4, 3);
        node[8] = kind.to_raw().to_ne_bytes()[0];
        node[9] = height;
        put16(&mut node, 10, u16::try_from(records.len()).expect("count"));
        let mut at = NODE_DESCRIPTOR_SIZE;
        for (i, record) in records.iter().enumerate() {
            put16(&mut node, SIZE - 2 * (i + 1), u16::try_from(at).expect("offset"));
            node[at..at + record.len()].copy_from_slice(record);
            at += record.len();
        }
        let free = SIZE - 2 * (records.len() + 1);
        put16(&mut node, free, u16::try_from(at).expect("offset"));
        node
    }

    /// Key record with its length field, pad byte and `tail`, padded even.
    fn keyed(key: &[u8], tail: &[u8]) -> Vec<u8> {
        let mut record = u16::try_from(key.len()).expect("key").to_be_bytes().to_vec();
        record.extend_from_slice(key);
        if key.len() % 2 == 1 {
            record.push(0);
        }
        record.extend_from_slice(tail);
        if record.len() % 2 == 1 {
            record.push(0);
        }
        record
    }

    /// Header node: header record, user data record and map record.
    fn disk_header() -> Vec<u8> {
        let mut header = vec![0_u8; HEADER_RECORD_SIZE];
        put16(&mut header, 0, 3);
        put32(&mut header, 2, 40);
        put32(&mut header, 6, 1234);
        put32(&mut header, 10, 5);
        put32(&mut header, 14, 77);
        put16(&mut header, 18, 512);
        put16(&mut header, 20, 516);
        put32(&mut header, 22, 96);
        put32(&mut header, 26, 11);
        put16(&mut header, 30, 0xBEEF);
        put32(&mut header, 32, 0x0001_0000);
        header[37] = 0xCF;
        put32(&mut header, 38, 6);
        put32(&mut header, 42, 0x1122_3344);
        let user = vec![0x5A_u8; 128];
        let map_len = SIZE - 2 * 4 - (NODE_DESCRIPTOR_SIZE + HEADER_RECORD_SIZE + 128);
        let mut map = vec![0_u8; map_len];
        map[0] = 0b1110_0000;
        disk_node(NodeKind::Header, 0, &[header, user, map])
    }

    #[test]
    fn leaf_round_trips() {
        let disk = disk_leaf();
        let mut node = disk.clone();
        swap_node(&mut node, SwapDirection::BigToHost, false).expect("to host");
        let desc = NodeDescriptor::parse(&node, Endian::Native).expect("desc");
        assert_eq!(desc.forward_link, 9);
        assert_eq!(desc.num_records, 2);
        assert_eq!(detect_order(&node), Some(Endian::Native));
        // key bodies and payloads keep disk order
        assert_eq!(&node[16..20], &disk[16..20]);
        swap_node(&mut node, SwapDirection::HostToBig, false).expect("to disk");
        assert_eq!(node, disk);
    }

    #[test]
    fn header_node_round_trips() {
        let disk = disk_header();
        let mut node = disk.clone();
        swap_node(&mut node, SwapDirection::BigToHost, false).expect("to host");
        let desc = NodeDescriptor::parse(&node, Endian::Native).expect("desc");
        assert_eq!(desc.kind, NodeKind::Header);
        assert_eq!(desc.num_records, HEADER_NODE_RECORDS);
        let header = HeaderRecord::parse(&node, Endian::Native).expect("header");
        assert_eq!(header.tree_depth, 3);
        assert_eq!(header.root_node, 40);
        assert_eq!(header.leaf_records, 1234);
        assert_eq!(header.node_size, 512);
        assert_eq!(header.max_key_length, 516);
        assert_eq!(header.total_nodes, 96);
        assert_eq!(header.free_nodes, 11);
        assert_eq!(header.clump_size, 0x0001_0000);
        assert_eq!(header.key_compare_type, 0xCF);
        // user data and map bits keep disk order
        let user = NODE_DESCRIPTOR_SIZE + HEADER_RECORD_SIZE;
        assert_eq!(&node[user..SIZE - 8], &disk[user..SIZE - 8]);
        swap_node(&mut node, SwapDirection::HostToBig, false).expect("to disk");
        assert_eq!(node, disk);
    }

    #[test]
    fn index_node_round_trips() {
        let disk = disk_node(
            NodeKind::Index,
            2,
            &[
                keyed(&[1, 2, 3, 4], &0x0102_0304_u32.to_be_bytes()),
                keyed(&[5, 6, 7], &77_u32.to_be_bytes()),
            ],
        );
        let mut node = disk.clone();
        swap_node(&mut node, SwapDirection::BigToHost, false).expect("to host");
        let first = NODE_DESCRIPTOR_SIZE;
        let second = first + key_span(4) + 4;
        assert_eq!(u16::from_ne_bytes([node[first], node[first + 1]]), 4);
        let child =
            |at: usize| u32::from_ne_bytes([node[at], node[at + 1], node[at + 2], node[at + 3]]);
        assert_eq!(child(first + key_span(4)), 0x0102_0304);
        assert_eq!(child(second + key_span(3)), 77);
        assert_eq!(&node[first + 2..first + 6], &[1, 2, 3, 4]);
        swap_node(&mut node, SwapDirection::HostToBig, false).expect("to disk");
        assert_eq!(node, disk);
    }

    #[test]
    fn index_node_needs_room_for_child_pointer() {
        // a 4-byte key with no child pointer after it
        let mut node = disk_node(NodeKind::Index, 2, &[keyed(&[1, 2, 3, 4], &[])]);
        let err = swap_node(&mut node, SwapDirection::BigToHost, false).expect_err("short");
        assert!(err.0.contains("record 0"));
    }

    #[test]
    fn map_node_round_trips() {
        let mut bits = vec![0_u8; SIZE - NODE_DESCRIPTOR_SIZE - 4];
        bits[0] = 0xFF;
        bits[1] = 0x80;
        let disk = disk_node(NodeKind::Map, 0, &[bits]);
        let mut node = disk.clone();
        swap_node(&mut node, SwapDirection::BigToHost, false).expect("to host");
        let desc = NodeDescriptor::parse(&node, Endian::Native).expect("desc");
        assert_eq!((desc.kind, desc.forward_link, desc.backward_link), (NodeKind::Map, 9, 3));
        assert_eq!(&node[NODE_DESCRIPTOR_SIZE..SIZE - 4], &disk[NODE_DESCRIPTOR_SIZE..SIZE - 4]);
        swap_node(&mut node, SwapDirection::HostToBig, false).expect("to disk");
        assert_eq!(node, disk);
    }

    #[test]
    fn header_only_leaves_descriptor_and_offsets() {
        let mut node = vec![0_u8; SIZE];
        node[8] = NodeKind::Header.to_raw().to_ne_bytes()[0];
        put16(&mut node, 10, 3);
        put16(&mut node, 14 + 18, 4096);
        put32(&mut node, 14 + 22, 77);
        put16(&mut node, SIZE - 2, 14);
        let before = node.clone();
        swap_node(&mut node, SwapDirection::HeaderRecordOnly, false).expect("swap");
        assert_eq!(&node[..14], &before[..14]);
        assert_eq!(&node[SIZE - 8..], &before[SIZE - 8..]);
        let header = HeaderRecord::parse(&node, Endian::Native).expect("parse");
        assert_eq!(header.node_size, 4096);
        assert_eq!(header.total_nodes, 77);
    }

    #[test]
    fn header_only_rejects_other_kinds() {
        let mut node = disk_leaf();
        assert!(swap_node(&mut node, SwapDirection::HeaderRecordOnly, false).is_err());
    }

    #[test]
    fn malformed_offsets_rejected() {
        let mut node = disk_leaf();
        put16(&mut node, SIZE - 4, 12);
        assert!(swap_node(&mut node, SwapDirection::BigToHost, false).is_err());

        let mut node = disk_leaf();
        put16(&mut node, SIZE - 4, 25);
        let err = swap_node(&mut node, SwapDirection::BigToHost, false).expect_err("odd");
        assert!(err.0.contains("odd"));

        let mut node = disk_leaf();
        put16(&mut node, 10, 400);
        assert!(swap_node(&mut node, SwapDirection::BigToHost, false).is_err());
    }

    #[test]
    fn key_overrun_rejected() {
        let mut node = disk_leaf();
        put16(&mut node, 26, 40);
        let err = swap_node(&mut node, SwapDirection::BigToHost, false).expect_err("overrun");
        assert!(err.0.contains("record 1"));
    }

    #[test]
    fn zero_node_needs_allow_empty() {
        let mut node = vec![0_u8; SIZE];
        assert!(swap_node(&mut node, SwapDirection::HostToBig, false).is_err());
        swap_node(&mut node, SwapDirection::HostToBig, true).expect("empty");
        assert!(node.iter().all(|&b| b == 0));
        assert_eq!(detect_order(&node), None);
    }

    #[test]
    fn finisher_reports_corruption() {
        let mut node = vec![0xEE_u8; SIZE];
        let err = NodeSwapper::new(FileId::CATALOG)
            .finish(&mut node)
            .expect_err("garbage");
        assert!(err.is_corruption());
    }

    fn any_node() -> impl Strategy<Value = Vec<u8>> {
        let record = (
            proptest::collection::vec(any::<u8>(), 0..24),
            proptest::collection::vec(any::<u8>(), 0..16),
            any::<u32>(),
        );
        (
            0_u8..3,
            2_u8..=16,
            proptest::collection::vec(record, 1..8),
        )
            .prop_map(|(kind, height, records)| match kind {
                0 => {
                    let leaf: Vec<_> = records.iter().map(|(k, p, _)| keyed(k, p)).collect();
                    disk_node(NodeKind::Leaf, 1, &leaf)
                }
                1 => {
                    let index: Vec<_> = records
                        .iter()
                        .map(|(k, _, child)| keyed(k, &child.to_be_bytes()))
                        .collect();
                    disk_node(NodeKind::Index, height, &index)
                }
                _ => {
                    let mut bits: Vec<u8> = records
                        .iter()
                        .flat_map(|(k, p, _)| k.iter().chain(p))
                        .copied()
                        .collect();
                    bits.resize((bits.len() + 2) & !1, 0);
                    disk_node(NodeKind::Map, 0, &[bits])
                }
            })
    }

    proptest! {
        #[test]
        fn double_swap_restores_any_node(disk in any_node()) {
            let mut node = disk.clone();
            prop_assert!(swap_node(&mut node, SwapDirection::BigToHost, false).is_ok());
            prop_assert_eq!(detect_order(&node), Some(Endian::Native));
            prop_assert!(swap_node(&mut node, SwapDirection::HostToBig, false).is_ok());
            prop_assert_eq!(node, disk);
        }

        #[test]
        fn double_swap_restores_any_header_record(
            fields in proptest::collection::vec(any::<u8>(), HEADER_RECORD_SIZE),
        ) {
            let mut disk = disk_header();
            let at = NODE_DESCRIPTOR_SIZE;
            disk[at..at + HEADER_RECORD_SIZE].copy_from_slice(&fields);
            let mut node = disk.clone();
            prop_assert!(swap_node(&mut node, SwapDirection::BigToHost, false).is_ok());
            let header = HeaderRecord::parse(&node, Endian::Native);
            prop_assert_eq!(
                header.map(|h| h.total_nodes).ok(),
                Some(u32::from_be_bytes([fields[22], fields[23], fields[24], fields[25]]))
            );
            prop_assert!(swap_node(&mut node, SwapDirection::HostToBig, false).is_ok());
            prop_assert_eq!(node, disk);
        }
    }
}
