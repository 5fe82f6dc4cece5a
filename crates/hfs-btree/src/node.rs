//! Record-level view of a host-order node.
//!
//! A decoded [`Node`] owns its records. Keys are kept exactly as a
//! comparator expects them, big-endian with the length prefix, and an index
//! record's payload is its child node number in big-endian. Encoding packs
//! the records from offset 14 and rebuilds the offset table, so every
//! structural edit is "decode, change the vector, encode".

use crate::swap::key_span;
use crate::{BTreeError, BTreeResult};
use hfs_ondisk::{Endian, NODE_DESCRIPTOR_SIZE, NodeDescriptor, NodeKind};
use hfs_types::FileId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Record {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

impl Record {
    pub fn index(key: Vec<u8>, child: u32) -> Self {
        Self {
            key,
            data: child.to_be_bytes().to_vec(),
        }
    }

    /// Child node of an index record.
    pub fn child(&self) -> u32 {
        match self.data.get(..4) {
            Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            None => 0,
        }
    }

    fn key_len(&self) -> usize {
        self.key.len().saturating_sub(2)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub num: u32,
    pub desc: NodeDescriptor,
    pub records: Vec<Record>,
}

/// Node geometry shared by every node of one tree.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Layout {
    pub file: FileId,
    pub node_size: usize,
    pub max_key_length: u16,
    /// Index keys carry their own length instead of `max_key_length`.
    pub variable_index: bool,
}

impl Layout {
    /// Record bytes plus its slot in the offset table.
    pub fn record_cost(&self, kind: NodeKind, rec: &Record) -> usize {
        let body = if kind == NodeKind::Index {
            let key_len = if self.variable_index {
                rec.key_len()
            } else {
                usize::from(self.max_key_length).max(rec.key_len())
            };
            key_span(key_len) + 4
        } else {
            key_span(rec.key_len()) + rec.data.len().next_multiple_of(2)
        };
        body + 2
    }

    /// Bytes available to record costs.
    pub fn capacity(&self) -> usize {
        self.node_size - NODE_DESCRIPTOR_SIZE - 2
    }

    /// Largest record cost that still lets any node split into two halves.
    pub fn max_record_cost(&self) -> usize {
        self.capacity() / 2
    }

    pub fn used(&self, kind: NodeKind, records: &[Record]) -> usize {
        records.iter().map(|r| self.record_cost(kind, r)).sum()
    }

    pub fn fits(&self, kind: NodeKind, records: &[Record]) -> bool {
        self.used(kind, records) <= self.capacity()
    }

    /// Less than half full.
    pub fn underfull(&self, kind: NodeKind, records: &[Record]) -> bool {
        self.used(kind, records) * 2 < self.capacity()
    }

    /// Split point `k` (records `..k` stay, `k..` move right) that leaves
    /// both halves fitting and closest in size.
    pub fn split_point(&self, kind: NodeKind, records: &[Record]) -> Option<usize> {
        let costs: Vec<usize> = records.iter().map(|r| self.record_cost(kind, r)).collect();
        let total: usize = costs.iter().sum();
        let cap = self.capacity();
        let mut left = 0;
        let mut best: Option<(usize, usize)> = None;
        for k in 1..records.len() {
            left += costs[k - 1];
            let right = total - left;
            if left > cap {
                break;
            }
            if right > cap {
                continue;
            }
            let skew = left.abs_diff(right);
            if best.is_none_or(|(_, s)| skew < s) {
                best = Some((k, skew));
            }
        }
        best.map(|(k, _)| k)
    }

    // ── Decode ─────────────────────────────────────────────────────────

    /// Decode a leaf or index node held in host order.
    pub fn decode(&self, num: u32, buf: &[u8]) -> BTreeResult<Node> {
        let corrupt = |detail: String| BTreeError::corrupt(self.file, num, detail);
        let desc = NodeDescriptor::parse(buf, Endian::Native)?;
        if !matches!(desc.kind, NodeKind::Leaf | NodeKind::Index) {
            return Err(corrupt(format!("expected leaf or index node, found {:?}", desc.kind)));
        }
        let count = usize::from(desc.num_records);
        let size = buf.len();
        if NODE_DESCRIPTOR_SIZE + 2 * (count + 1) > size {
            return Err(corrupt(format!("{count} records overflow the node")));
        }
        let offset = |i: usize| Endian::Native.read_u16(buf, size - 2 * (i + 1)).map(usize::from);

        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            let start = offset(i)?;
            let end = offset(i + 1)?;
            if end <= start || end > size {
                return Err(corrupt(format!("record {i} bounds {start}..{end}")));
            }
            let key_len = usize::from(Endian::Native.read_u16(buf, start)?);
            let body = start + key_span(key_len);
            if body > end {
                return Err(corrupt(format!("record {i} key overruns record")));
            }
            let key_len16 = u16::try_from(key_len).map_err(|_| corrupt("key length".into()))?;
            let mut key = Vec::with_capacity(2 + key_len);
            key.extend_from_slice(&key_len16.to_be_bytes());
            key.extend_from_slice(&buf[start + 2..start + 2 + key_len]);
            let data = if desc.kind == NodeKind::Index {
                if end - body < 4 {
                    return Err(corrupt(format!("index record {i} has no child pointer")));
                }
                Endian::Native.read_u32(buf, body)?.to_be_bytes().to_vec()
            } else {
                buf[body..end].to_vec()
            };
            records.push(Record { key, data });
        }
        Ok(Node { num, desc, records })
    }

    // ── Encode ─────────────────────────────────────────────────────────

    /// Encode `node` into `buf` (host order). The whole node is rewritten.
    pub fn encode(&self, node: &Node, buf: &mut [u8]) -> BTreeResult<()> {
        let kind = node.desc.kind;
        if !self.fits(kind, &node.records) {
            return Err(BTreeError::corrupt(
                self.file,
                node.num,
                format!("{} records do not fit", node.records.len()),
            ));
        }
        buf.fill(0);
        let size = buf.len();
        let mut desc = node.desc;
        desc.num_records = u16::try_from(node.records.len())
            .map_err(|_| BTreeError::corrupt(self.file, node.num, "record count"))?;
        desc.encode(buf, Endian::Native)?;

        let mut at = NODE_DESCRIPTOR_SIZE;
        for (i, rec) in node.records.iter().enumerate() {
            Endian::Native.write_u16(buf, size - 2 * (i + 1), to_u16(at))?;
            let body = &rec.key[2.min(rec.key.len())..];
            let stored_len = if kind == NodeKind::Index && !self.variable_index {
                usize::from(self.max_key_length).max(body.len())
            } else {
                body.len()
            };
            Endian::Native.write_u16(buf, at, to_u16(stored_len))?;
            buf[at + 2..at + 2 + body.len()].copy_from_slice(body);
            at += key_span(stored_len);
            if kind == NodeKind::Index {
                Endian::Native.write_u32(buf, at, rec.child())?;
                at += 4;
            } else {
                buf[at..at + rec.data.len()].copy_from_slice(&rec.data);
                at += rec.data.len().next_multiple_of(2);
            }
        }
        Endian::Native.write_u16(buf, size - 2 * (node.records.len() + 1), to_u16(at))?;
        Ok(())
    }
}

/// Offsets within a node always fit: nodes are at most 32 KiB.
fn to_u16(value: usize) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}
