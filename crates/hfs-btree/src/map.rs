//! Node allocation map.
//!
//! One bit per node, most significant bit first, set when the node is in
//! use. The first bits live in the map record of the header node; the rest
//! in a chain of map nodes reached through the header node's forward link.
//!
//! | Segment | Node | Bytes |
//! |---------|------|-------|
//! | header map record | 0 | `nodeSize - 256` from offset 248 |
//! | each map node | chained | `nodeSize - 20` from offset 14 |

use crate::tree::{BTree, TreeState};
use crate::{BTreeError, BTreeResult};
use hfs_alloc::bitmap::{bit_is_set, clear_bits, find_clear_run, set_bits};
use hfs_block::GetMode;
use hfs_journal::Transaction;
use hfs_ondisk::btree::{HEADER_MAP_RECORD_OFFSET, MAP_NODE_OVERHEAD};
use hfs_ondisk::{Endian, NODE_DESCRIPTOR_SIZE, NodeDescriptor, NodeKind};
use std::collections::HashSet;
use tracing::{debug, error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MapSegment {
    pub node: u32,
    /// Byte offset of the bits within the node.
    pub start: usize,
    pub len: usize,
    /// Node number described by the segment's first bit.
    pub first_bit: u64,
}

impl MapSegment {
    fn bits(&self) -> u64 {
        u64::try_from(self.len * 8).unwrap_or(u64::MAX)
    }

    fn covers(&self, node: u32) -> bool {
        let n = u64::from(node);
        n >= self.first_bit && n < self.first_bit + self.bits()
    }
}

/// Bytes of map record in the header node.
pub(crate) fn header_map_len(node_size: usize) -> usize {
    node_size - HEADER_MAP_RECORD_OFFSET - 8
}

/// Bytes of map record in a map node.
pub(crate) fn map_node_len(node_size: usize) -> usize {
    node_size - MAP_NODE_OVERHEAD
}

/// Lay out an empty map node in host order: one record of zero bits.
pub(crate) fn init_map_node(buf: &mut [u8]) -> BTreeResult<()> {
    buf.fill(0);
    let size = buf.len();
    NodeDescriptor {
        forward_link: 0,
        backward_link: 0,
        kind: NodeKind::Map,
        height: 0,
        num_records: 1,
    }
    .encode(buf, Endian::Native)?;
    let first = u16::try_from(NODE_DESCRIPTOR_SIZE).unwrap_or(14);
    let free = u16::try_from(NODE_DESCRIPTOR_SIZE + map_node_len(size)).unwrap_or(u16::MAX);
    Endian::Native.write_u16(buf, size - 2, first)?;
    Endian::Native.write_u16(buf, size - 4, free)?;
    Ok(())
}

impl BTree {
    /// Walk the map chain from the header node.
    pub(crate) fn map_segments(&self, st: &TreeState) -> BTreeResult<Vec<MapSegment>> {
        let ns = usize::from(st.header.node_size);
        let head = MapSegment {
            node: 0,
            start: HEADER_MAP_RECORD_OFFSET,
            len: header_map_len(ns),
            first_bit: 0,
        };
        let mut next_bit = head.first_bit + head.bits();
        let mut segments = vec![head];
        let mut seen = HashSet::from([0_u32]);
        let mut next = self.read_descriptor(st, 0)?.forward_link;
        while next != 0 {
            if !seen.insert(next) {
                error!(target: "hfs::btree", file = %self.file, node = next, invariant = "acyclic_chain", "btree_invariant_violation");
                return Err(BTreeError::corrupt(self.file, next, "map node chain loops"));
            }
            let desc = self.read_descriptor(st, next)?;
            if desc.kind != NodeKind::Map {
                return Err(BTreeError::corrupt(
                    self.file,
                    next,
                    format!("map chain reaches a {:?} node", desc.kind),
                ));
            }
            let seg = MapSegment {
                node: next,
                start: NODE_DESCRIPTOR_SIZE,
                len: map_node_len(ns),
                first_bit: next_bit,
            };
            next_bit += seg.bits();
            segments.push(seg);
            next = desc.forward_link;
        }
        Ok(segments)
    }

    /// All map bits concatenated, with the segments they came from.
    pub(crate) fn read_map(&self, st: &TreeState) -> BTreeResult<(Vec<u8>, Vec<MapSegment>)> {
        let segments = self.map_segments(st)?;
        let mut bits = Vec::with_capacity(segments.iter().map(|s| s.len).sum());
        for seg in &segments {
            let guard = self.checkout(st, seg.node)?;
            bits.extend_from_slice(&guard[seg.start..seg.start + seg.len]);
        }
        Ok((bits, segments))
    }

    /// Claim the lowest free node.
    pub(crate) fn allocate_node(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
    ) -> BTreeResult<u32> {
        let total = u64::from(st.header.total_nodes);
        for seg in self.map_segments(st)? {
            if seg.first_bit >= total {
                break;
            }
            let limit = usize::try_from((total - seg.first_bit).min(seg.bits())).unwrap_or(0);
            let guard = self.checkout(st, seg.node)?;
            let bits = &guard[seg.start..seg.start + seg.len];
            let Some((bit, _)) = find_clear_run(bits, 0, limit, 1, 1) else {
                continue;
            };
            drop(guard);
            let num = u32::try_from(seg.first_bit + u64::try_from(bit).unwrap_or(u64::MAX))
                .map_err(|_| BTreeError::corrupt(self.file, seg.node, "map bit out of range"))?;
            self.modify_raw(txn, st, seg.node, |buf| {
                set_bits(&mut buf[seg.start..seg.start + seg.len], bit, 1);
                Ok(())
            })?;
            st.header.free_nodes = st.header.free_nodes.saturating_sub(1);
            trace!(target: "hfs::btree", file = %self.file, node = num, free_nodes = st.header.free_nodes, "btree_node_alloc");
            return Ok(num);
        }
        if st.header.free_nodes > 0 {
            error!(target: "hfs::btree", file = %self.file, free_nodes = st.header.free_nodes, invariant = "map_matches_free_count", "btree_invariant_violation");
            return Err(BTreeError::corrupt(
                self.file,
                0,
                format!("map full but header reports {} free nodes", st.header.free_nodes),
            ));
        }
        Err(BTreeError::NoSpace)
    }

    /// Release node `num` and drop it from the transaction and cache.
    pub(crate) fn free_node(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
        num: u32,
    ) -> BTreeResult<()> {
        if num == 0 || num >= st.header.total_nodes {
            return Err(BTreeError::corrupt(self.file, num, "free of a node outside the tree"));
        }
        let seg = self
            .map_segments(st)?
            .into_iter()
            .find(|s| s.covers(num))
            .ok_or_else(|| BTreeError::corrupt(self.file, num, "node not covered by the map"))?;
        let bit = usize::try_from(u64::from(num) - seg.first_bit).unwrap_or(usize::MAX);
        let file = self.file;
        self.modify_raw(txn, st, seg.node, |buf| {
            let bits = &mut buf[seg.start..seg.start + seg.len];
            if !bit_is_set(bits, bit) {
                error!(target: "hfs::btree", file = %file, node = num, invariant = "no_double_free", "btree_invariant_violation");
                return Err(BTreeError::corrupt(file, num, "node freed twice"));
            }
            clear_bits(bits, bit, 1);
            Ok(())
        })?;
        st.header.free_nodes += 1;

        let (at, len) = self.locate(st, num)?;
        let guard = self.cache.get(self.buf_key(num), at, len, GetMode::Empty)?;
        txn.kill_block(guard)?;
        trace!(target: "hfs::btree", file = %self.file, node = num, free_nodes = st.header.free_nodes, "btree_node_free");
        Ok(())
    }

    /// Add map nodes until the map covers every node of the file.
    pub(crate) fn ensure_map_capacity(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
    ) -> BTreeResult<()> {
        loop {
            let segments = self.map_segments(st)?;
            let capacity: u64 = segments.iter().map(MapSegment::bits).sum();
            if capacity >= u64::from(st.header.total_nodes) {
                return Ok(());
            }
            let Some(last) = segments.last().copied() else {
                return Ok(());
            };
            // the new node is the first one the current map cannot describe,
            // so its own bit is bit 0 of the node itself
            let num = u32::try_from(capacity)
                .map_err(|_| BTreeError::corrupt(self.file, 0, "map capacity overflow"))?;
            let mut bytes = vec![0; usize::from(st.header.node_size)];
            init_map_node(&mut bytes)?;
            set_bits(&mut bytes[NODE_DESCRIPTOR_SIZE..], 0, 1);
            self.write_raw(txn, st, num, &bytes)?;
            self.set_links(txn, st, last.node, Some(num), None)?;
            st.header.free_nodes = st.header.free_nodes.saturating_sub(1);
            debug!(target: "hfs::btree", file = %self.file, node = num, after = last.node, covers_from = capacity, "btree_map_node_add");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{SwapDirection, swap_node};

    #[test]
    fn map_record_sizes() {
        assert_eq!(header_map_len(512), 256);
        assert_eq!(header_map_len(4096), 3840);
        assert_eq!(map_node_len(512), 492);
        assert_eq!(
            u32::try_from(header_map_len(4096) * 8).expect("bits"),
            hfs_ondisk::HeaderRecord::header_map_bits(4096)
        );
    }

    #[test]
    fn fresh_map_node_is_well_formed() {
        let mut buf = vec![0xFF; 512];
        init_map_node(&mut buf).expect("init");
        assert!(buf[14..506].iter().all(|&b| b == 0));
        swap_node(&mut buf, SwapDirection::HostToBig, false).expect("valid map node");
        assert_eq!(&buf[510..], &[0, 14]);
        assert_eq!(&buf[508..510], &[0x01, 0xFA]);
    }
}
