//! B-tree control block.
//!
//! A [`BTree`] owns the in-memory copy of the header record and the extent
//! map of its file. Every public operation takes the tree lock for its
//! whole duration, so a caller sees each insert, delete or search as one
//! step. Nodes are checked out of the buffer cache one at a time and
//! normalized to host order on the way in:
//!
//! | Buffer state | Action on checkout |
//! |--------------|--------------------|
//! | just read from the device | full [`swap_node`] to host order |
//! | cached, already written home (disk order) | same |
//! | cached in host order | none |
//! | conversion fails | buffer trashed, `Corruption` returned |

use crate::compare::KeyComparator;
use crate::node::{Layout, Node};
use crate::swap::{NodeSwapper, SwapDirection, detect_order, swap_node};
use crate::{BTreeError, BTreeResult};
use hfs_alloc::Allocator;
use hfs_alloc::bitmap::{bit_is_set, count_set};
use hfs_block::{BlockCacheError, BufGuard, BufKey, BufferCache, GetMode, NodeFinisher, ReleaseMode};
use hfs_journal::Transaction;
use hfs_ondisk::btree::HEADER_NODE_RECORDS;
use hfs_ondisk::{
    BTreeAttributes, Endian, ExtentMap, ForkData, HeaderRecord, NodeDescriptor, NodeKind,
};
use hfs_types::{ByteOffset, FileId, NodeSize};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Size of the first read of node 0, made before the node size is known.
const HINT_NODE_SIZE: usize = 512;
/// Offset of `nodeSize` within node 0.
const NODE_SIZE_FIELD: usize = 14 + 18;

// ── Public types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeStats {
    pub searches: u64,
    pub inserts: u64,
    pub deletes: u64,
    pub replaces: u64,
    pub splits: u64,
    pub merges: u64,
    pub redistributions: u64,
    pub extends: u64,
}

/// Where a key is, or would be inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    pub found: bool,
    /// Leaf node holding the position; 0 for an empty tree.
    pub node: u32,
    /// Record index of the key, or of its insertion point.
    pub index: usize,
}

/// Summary returned by a successful [`BTree::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeCheck {
    pub depth: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    /// Index and leaf nodes reachable from the root.
    pub reachable: u32,
    pub map_nodes: u32,
    pub leaf_nodes: u32,
    pub leaf_records: u32,
}

// ── Control block ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct TreeState {
    pub header: HeaderRecord,
    pub fork: ExtentMap,
    /// The extents of the file changed since the owner last asked.
    pub fork_changed: bool,
    pub stats: TreeStats,
}

/// One step of a root-to-leaf descent.
#[derive(Debug, Clone)]
pub(crate) struct Level {
    pub node: Node,
    /// Child slot taken in an index node; record or insertion index in the
    /// leaf.
    pub index: usize,
}

#[derive(Debug)]
pub(crate) struct Path {
    pub levels: Vec<Level>,
    pub found: bool,
}

pub struct BTree {
    pub(crate) file: FileId,
    pub(crate) cache: BufferCache,
    pub(crate) comparator: Arc<dyn KeyComparator>,
    pub(crate) allocator: Option<Allocator>,
    pub(crate) finisher: Arc<dyn NodeFinisher>,
    pub(crate) state: Mutex<TreeState>,
}

impl fmt::Debug for BTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("BTree")
            .field("file", &self.file)
            .field("root", &st.header.root_node)
            .field("depth", &st.header.tree_depth)
            .field("total_nodes", &st.header.total_nodes)
            .field("free_nodes", &st.header.free_nodes)
            .finish_non_exhaustive()
    }
}

impl BTree {
    /// Open the tree stored in `fork` of `file`.
    ///
    /// `allocator` is needed only to grow the file; a tree opened without
    /// one fails inserts that need new nodes with [`BTreeError::NoSpace`].
    pub fn open(
        cache: BufferCache,
        file: FileId,
        fork: ExtentMap,
        comparator: Arc<dyn KeyComparator>,
        allocator: Option<Allocator>,
    ) -> BTreeResult<Self> {
        let header = read_header(&cache, file, &fork)?;
        header.validate().map_err(|err| {
            error!(target: "hfs::btree", file = %file, %err, "btree_header_invalid");
            BTreeError::corrupt(file, 0, format!("header record: {err}"))
        })?;
        let need = u64::from(header.total_nodes) * u64::from(header.node_size);
        if need > fork.physical_len() {
            error!(target: "hfs::btree", file = %file, need, have = fork.physical_len(), "btree_size_mismatch");
            return Err(BTreeError::corrupt(
                file,
                0,
                format!(
                    "{} nodes of {} bytes exceed file length {}",
                    header.total_nodes,
                    header.node_size,
                    fork.physical_len()
                ),
            ));
        }

        let tree = Self::from_parts(cache, file, fork, header, comparator, allocator);
        {
            let st = tree.state.lock();
            let guard = tree.checkout(&st, 0)?;
            let desc = NodeDescriptor::parse(&guard, Endian::Native)?;
            if desc.kind != NodeKind::Header || desc.num_records != HEADER_NODE_RECORDS {
                return Err(BTreeError::corrupt(file, 0, "node 0 is not a header node"));
            }
        }
        debug!(
            target: "hfs::btree",
            file = %file,
            node_size = header.node_size,
            depth = header.tree_depth,
            total_nodes = header.total_nodes,
            free_nodes = header.free_nodes,
            leaf_records = header.leaf_records,
            "btree_open"
        );
        Ok(tree)
    }

    pub(crate) fn from_parts(
        cache: BufferCache,
        file: FileId,
        fork: ExtentMap,
        header: HeaderRecord,
        comparator: Arc<dyn KeyComparator>,
        allocator: Option<Allocator>,
    ) -> Self {
        Self {
            file,
            cache,
            comparator,
            allocator,
            finisher: Arc::new(NodeSwapper::new(file)),
            state: Mutex::new(TreeState {
                header,
                fork,
                fork_changed: false,
                stats: TreeStats::default(),
            }),
        }
    }

    // ── Getters ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn file(&self) -> FileId {
        self.file
    }

    #[must_use]
    pub fn header(&self) -> HeaderRecord {
        self.state.lock().header
    }

    #[must_use]
    pub fn node_size(&self) -> u16 {
        self.state.lock().header.node_size
    }

    #[must_use]
    pub fn leaf_records(&self) -> u32 {
        self.state.lock().header.leaf_records
    }

    #[must_use]
    pub fn comparator(&self) -> &Arc<dyn KeyComparator> {
        &self.comparator
    }

    #[must_use]
    pub fn extent_map(&self) -> ExtentMap {
        self.state.lock().fork.clone()
    }

    /// Fork record describing the tree file as it stands now.
    #[must_use]
    pub fn fork_data(&self) -> ForkData {
        let st = self.state.lock();
        ForkData {
            logical_size: st.fork.physical_len(),
            clump_size: st.header.clump_size,
            total_blocks: u32::try_from(st.fork.total_blocks()).unwrap_or(u32::MAX),
            extents: st.fork.inline_extents(),
        }
    }

    /// True once after the file grew; the owner rewrites the fork record.
    pub fn take_fork_changed(&self) -> bool {
        std::mem::take(&mut self.state.lock().fork_changed)
    }

    #[must_use]
    pub fn stats(&self) -> TreeStats {
        self.state.lock().stats
    }

    // ── Node I/O ────────────────────────────────────────────────────────

    pub(crate) fn layout(&self, st: &TreeState) -> Layout {
        Layout {
            file: self.file,
            node_size: usize::from(st.header.node_size),
            max_key_length: st.header.max_key_length,
            variable_index: st
                .header
                .attributes
                .contains(BTreeAttributes::VARIABLE_INDEX_KEYS),
        }
    }

    pub(crate) fn buf_key(&self, num: u32) -> BufKey {
        BufKey::new(self.file, u64::from(num))
    }

    /// Device offset and length of node `num`.
    pub(crate) fn locate(&self, st: &TreeState, num: u32) -> BTreeResult<(ByteOffset, usize)> {
        if num >= st.header.total_nodes {
            return Err(BTreeError::corrupt(
                self.file,
                num,
                format!("node beyond total_nodes {}", st.header.total_nodes),
            ));
        }
        let ns = u64::from(st.header.node_size);
        let at = st
            .fork
            .map_range(u64::from(num) * ns, ns)
            .ok_or_else(|| BTreeError::corrupt(self.file, num, "node not mapped by the file"))?;
        Ok((ByteOffset(at), usize::from(st.header.node_size)))
    }

    /// Check out node `num` in host order.
    pub(crate) fn checkout(&self, st: &TreeState, num: u32) -> BTreeResult<BufGuard> {
        let (at, len) = self.locate(st, num)?;
        let mut guard = self.cache.get(self.buf_key(num), at, len, GetMode::Read)?;
        if guard.is_from_disk() || detect_order(&guard) == Some(Endian::Big) {
            if let Err(err) = swap_node(&mut guard, SwapDirection::BigToHost, true) {
                error!(target: "hfs::btree", file = %self.file, node = num, %err, "btree_read_corrupt_node");
                if let Err(release) = guard.release(ReleaseMode::Trash) {
                    warn!(target: "hfs::btree", file = %self.file, node = num, %release, "btree_trash_failed");
                }
                return Err(BTreeError::corrupt(self.file, num, err.0));
            }
        }
        Ok(guard)
    }

    /// Decode leaf or index node `num`.
    pub(crate) fn read_node(&self, st: &TreeState, num: u32) -> BTreeResult<Node> {
        let guard = self.checkout(st, num)?;
        self.layout(st).decode(num, &guard)
    }

    pub(crate) fn read_descriptor(&self, st: &TreeState, num: u32) -> BTreeResult<NodeDescriptor> {
        let guard = self.checkout(st, num)?;
        Ok(NodeDescriptor::parse(&guard, Endian::Native)?)
    }

    /// Rewrite node `node.num` from its decoded form.
    pub(crate) fn write_node(
        &self,
        txn: &mut Transaction<'_>,
        st: &TreeState,
        node: &Node,
    ) -> BTreeResult<()> {
        let mut bytes = vec![0; usize::from(st.header.node_size)];
        self.layout(st).encode(node, &mut bytes)?;
        self.write_raw(txn, st, node.num, &bytes)?;
        trace!(
            target: "hfs::btree",
            file = %self.file,
            node = node.num,
            kind = ?node.desc.kind,
            records = node.records.len(),
            "btree_node_write"
        );
        Ok(())
    }

    /// Replace node `num` with host-order `bytes` without reading it.
    pub(crate) fn write_raw(
        &self,
        txn: &mut Transaction<'_>,
        st: &TreeState,
        num: u32,
        bytes: &[u8],
    ) -> BTreeResult<()> {
        let (at, len) = self.locate(st, num)?;
        if bytes.len() != len {
            return Err(BTreeError::corrupt(
                self.file,
                num,
                format!("{} byte image for a {len} byte node", bytes.len()),
            ));
        }
        let mut guard = self.cache.get(self.buf_key(num), at, len, GetMode::Empty)?;
        txn.modify_start(&guard)?;
        guard.copy_from_slice(bytes);
        txn.modify_end(guard, Some(Arc::clone(&self.finisher)))?;
        Ok(())
    }

    /// Edit the raw host-order bytes of node `num`.
    pub(crate) fn modify_raw(
        &self,
        txn: &mut Transaction<'_>,
        st: &TreeState,
        num: u32,
        edit: impl FnOnce(&mut [u8]) -> BTreeResult<()>,
    ) -> BTreeResult<()> {
        let mut guard = self.checkout(st, num)?;
        let mut bytes = guard.to_vec();
        edit(&mut bytes)?;
        txn.modify_start(&guard)?;
        guard.copy_from_slice(&bytes);
        txn.modify_end(guard, Some(Arc::clone(&self.finisher)))?;
        Ok(())
    }

    /// Write the in-memory header record to node 0.
    pub(crate) fn write_header(&self, txn: &mut Transaction<'_>, st: &TreeState) -> BTreeResult<()> {
        let header = st.header;
        self.modify_raw(txn, st, 0, |buf| Ok(header.encode(buf, Endian::Native)?))
    }

    /// Rewrite the sibling links of node `num`; `None` keeps a link.
    pub(crate) fn set_links(
        &self,
        txn: &mut Transaction<'_>,
        st: &TreeState,
        num: u32,
        forward: Option<u32>,
        backward: Option<u32>,
    ) -> BTreeResult<()> {
        self.modify_raw(txn, st, num, |buf| {
            let mut desc = NodeDescriptor::parse(buf, Endian::Native)?;
            if let Some(f) = forward {
                desc.forward_link = f;
            }
            if let Some(b) = backward {
                desc.backward_link = b;
            }
            Ok(desc.encode(buf, Endian::Native)?)
        })
    }

    // ── Search ──────────────────────────────────────────────────────────

    pub(crate) fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.comparator.compare(a, b)
    }

    /// Root-to-leaf path for `key`; `None` for an empty tree.
    pub(crate) fn descend(&self, st: &TreeState, key: &[u8]) -> BTreeResult<Option<Path>> {
        let root = st.header.root_node;
        if root == 0 {
            return Ok(None);
        }
        let mut levels = Vec::with_capacity(usize::from(st.header.tree_depth));
        let mut num = root;
        let mut height = st.header.tree_depth;
        loop {
            let node = self.read_node(st, num)?;
            let shape_ok = height > 0
                && u16::from(node.desc.height) == height
                && !node.records.is_empty()
                && (node.desc.kind == NodeKind::Leaf) == (height == 1);
            if !shape_ok {
                error!(
                    target: "hfs::btree",
                    file = %self.file,
                    node = num,
                    invariant = "descent_shape",
                    expected_height = height,
                    height = node.desc.height,
                    records = node.records.len(),
                    "btree_invariant_violation"
                );
                return Err(BTreeError::corrupt(
                    self.file,
                    num,
                    format!(
                        "{:?} node of height {} with {} records where height {height} expected",
                        node.desc.kind,
                        node.desc.height,
                        node.records.len()
                    ),
                ));
            }
            if node.desc.kind == NodeKind::Leaf {
                let (found, index) = match node
                    .records
                    .binary_search_by(|r| self.cmp(&r.key, key))
                {
                    Ok(i) => (true, i),
                    Err(i) => (false, i),
                };
                levels.push(Level { node, index });
                return Ok(Some(Path { levels, found }));
            }
            let index = node
                .records
                .partition_point(|r| self.cmp(&r.key, key) != Ordering::Greater)
                .saturating_sub(1);
            num = node.records[index].child();
            levels.push(Level { node, index });
            height -= 1;
        }
    }

    pub fn search(&self, key: &[u8]) -> BTreeResult<SearchResult> {
        let mut st = self.state.lock();
        st.stats.searches += 1;
        let result = match self.descend(&st, key)? {
            None => SearchResult {
                found: false,
                node: 0,
                index: 0,
            },
            Some(path) => {
                let leaf = path.levels.last().map_or(0, |l| l.node.num);
                let index = path.levels.last().map_or(0, |l| l.index);
                SearchResult {
                    found: path.found,
                    node: leaf,
                    index,
                }
            }
        };
        trace!(target: "hfs::btree", file = %self.file, found = result.found, node = result.node, index = result.index, "btree_search");
        Ok(result)
    }

    /// Payload of the record with exactly `key`.
    pub fn lookup(&self, key: &[u8]) -> BTreeResult<Option<Vec<u8>>> {
        let mut st = self.state.lock();
        st.stats.searches += 1;
        let Some(mut path) = self.descend(&st, key)? else {
            return Ok(None);
        };
        if !path.found {
            return Ok(None);
        }
        Ok(path
            .levels
            .pop()
            .map(|leaf| leaf.node.records[leaf.index].data.clone()))
    }

    /// Record with the greatest key not above `key`.
    pub fn lookup_le(&self, key: &[u8]) -> BTreeResult<Option<(Vec<u8>, Vec<u8>)>> {
        let mut st = self.state.lock();
        st.stats.searches += 1;
        let Some(mut path) = self.descend(&st, key)? else {
            return Ok(None);
        };
        let Some(leaf) = path.levels.pop() else {
            return Ok(None);
        };
        let at = if path.found { leaf.index + 1 } else { leaf.index };
        if at > 0 {
            let rec = &leaf.node.records[at - 1];
            return Ok(Some((rec.key.clone(), rec.data.clone())));
        }
        let prev = leaf.node.desc.backward_link;
        if prev == 0 {
            return Ok(None);
        }
        let node = self.read_node(&st, prev)?;
        Ok(node.records.last().map(|r| (r.key.clone(), r.data.clone())))
    }

    /// Visit records in key order starting at the first key not below
    /// `key`, until `visit` returns false.
    pub fn scan_from(
        &self,
        key: &[u8],
        mut visit: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> BTreeResult<()> {
        let st = self.state.lock();
        let Some(mut path) = self.descend(&st, key)? else {
            return Ok(());
        };
        let Some(leaf) = path.levels.pop() else {
            return Ok(());
        };
        let mut node = leaf.node;
        let mut start = leaf.index;
        let mut hops = 0_u32;
        loop {
            for rec in &node.records[start.min(node.records.len())..] {
                if !visit(&rec.key, &rec.data) {
                    return Ok(());
                }
            }
            let next = node.desc.forward_link;
            if next == 0 {
                return Ok(());
            }
            hops += 1;
            if hops > st.header.total_nodes {
                return Err(self.chain_loop(next));
            }
            node = self.read_node(&st, next)?;
            start = 0;
        }
    }

    /// Every record in key order, walking the leaf chain.
    pub fn records(&self) -> BTreeResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let st = self.state.lock();
        let mut out = Vec::with_capacity(usize::try_from(st.header.leaf_records).unwrap_or(0));
        let mut next = st.header.first_leaf_node;
        let mut hops = 0_u32;
        while next != 0 {
            hops += 1;
            if hops > st.header.total_nodes {
                return Err(self.chain_loop(next));
            }
            let node = self.read_node(&st, next)?;
            if node.desc.kind != NodeKind::Leaf {
                return Err(BTreeError::corrupt(self.file, next, "leaf chain reaches a non-leaf"));
            }
            out.extend(node.records.into_iter().map(|r| (r.key, r.data)));
            next = node.desc.forward_link;
        }
        Ok(out)
    }

    fn chain_loop(&self, node: u32) -> BTreeError {
        error!(target: "hfs::btree", file = %self.file, node, invariant = "acyclic_chain", "btree_invariant_violation");
        BTreeError::corrupt(self.file, node, "node chain loops")
    }

    // ── Consistency check ───────────────────────────────────────────────

    /// Verify the whole tree: node shapes, key order at every level, index
    /// keys against their children, sibling chains, header counters, and
    /// the node map against the nodes actually in use.
    pub fn check(&self) -> BTreeResult<TreeCheck> {
        let st = self.state.lock();
        let h = st.header;
        let fail = |node: u32, invariant: &'static str, detail: String| {
            error!(target: "hfs::btree", file = %self.file, node, invariant, %detail, "btree_invariant_violation");
            BTreeError::corrupt(self.file, node, format!("{invariant}: {detail}"))
        };

        let (map, segments) = self.read_map(&st)?;
        let total = usize::try_from(h.total_nodes).unwrap_or(usize::MAX);
        let in_use = |n: u32| bit_is_set(&map, usize::try_from(n).unwrap_or(usize::MAX));
        let mut seen: HashSet<u32> = segments.iter().map(|s| s.node).collect();
        for &n in &seen {
            if !in_use(n) {
                return Err(fail(n, "map_node_allocated", "bit clear".into()));
            }
        }
        let map_nodes = u32::try_from(seen.len() - 1).unwrap_or(u32::MAX);

        let mut reachable = 0_u32;
        let mut leaf_nodes = 0_u32;
        let mut leaf_records = 0_u32;
        if h.root_node == 0 {
            if h.tree_depth != 0 || h.first_leaf_node != 0 || h.last_leaf_node != 0 || h.leaf_records != 0 {
                return Err(fail(0, "empty_tree_header", format!("{h:?}")));
            }
        } else {
            // (node, key its parent expects it to start with)
            let mut level: Vec<(u32, Option<Vec<u8>>)> = vec![(h.root_node, None)];
            for height in (1..=h.tree_depth).rev() {
                let mut next_level = Vec::new();
                let mut prev: Option<(u32, u32)> = None; // (num, forward_link)
                let mut last_key: Option<Vec<u8>> = None;
                for (num, expected) in level {
                    if !seen.insert(num) {
                        return Err(fail(num, "node_reached_once", "node reached twice".into()));
                    }
                    if !in_use(num) {
                        return Err(fail(num, "reachable_node_allocated", "bit clear".into()));
                    }
                    let node = self.read_node(&st, num)?;
                    let leaf = height == 1;
                    if u16::from(node.desc.height) != height
                        || (node.desc.kind == NodeKind::Leaf) != leaf
                        || node.records.is_empty()
                    {
                        return Err(fail(
                            num,
                            "node_shape",
                            format!("{:?} height {} records {}", node.desc.kind, node.desc.height, node.records.len()),
                        ));
                    }
                    let back = prev.map_or(0, |(p, _)| p);
                    if node.desc.backward_link != back {
                        return Err(fail(num, "sibling_links", format!("backward {} expected {back}", node.desc.backward_link)));
                    }
                    if let Some((p, fwd)) = prev {
                        if fwd != num {
                            return Err(fail(p, "sibling_links", format!("forward {fwd} expected {num}")));
                        }
                    }
                    if let Some(k) = &expected {
                        if self.cmp(k, &node.records[0].key) != Ordering::Equal {
                            return Err(fail(num, "index_key_matches_child", "parent key differs from first key".into()));
                        }
                    }
                    for rec in &node.records {
                        if let Some(prev_key) = &last_key {
                            if self.cmp(prev_key, &rec.key) != Ordering::Less {
                                return Err(fail(num, "keys_ascending", "keys out of order".into()));
                            }
                        }
                        last_key = Some(rec.key.clone());
                    }
                    if leaf {
                        if leaf_nodes == 0 && h.first_leaf_node != num {
                            return Err(fail(num, "first_leaf", format!("header says {}", h.first_leaf_node)));
                        }
                        leaf_nodes += 1;
                        leaf_records += u32::try_from(node.records.len()).unwrap_or(u32::MAX);
                    } else {
                        next_level.extend(node.records.iter().map(|r| (r.child(), Some(r.key.clone()))));
                    }
                    reachable += 1;
                    prev = Some((num, node.desc.forward_link));
                }
                if let Some((p, fwd)) = prev {
                    if fwd != 0 {
                        return Err(fail(p, "sibling_links", format!("last node links forward to {fwd}")));
                    }
                    if height == 1 && h.last_leaf_node != p {
                        return Err(fail(p, "last_leaf", format!("header says {}", h.last_leaf_node)));
                    }
                }
                level = next_level;
            }
            if !level.is_empty() {
                return Err(fail(h.root_node, "tree_depth", "leaves below the recorded depth".into()));
            }
        }

        if leaf_records != h.leaf_records {
            return Err(fail(0, "leaf_record_count", format!("counted {leaf_records}, header {}", h.leaf_records)));
        }
        let used = count_set(&map, 0, total);
        if u64::try_from(used).unwrap_or(u64::MAX) != u64::from(h.total_nodes.saturating_sub(h.free_nodes)) {
            return Err(fail(0, "map_matches_free_count", format!("{used} bits set, {} free of {}", h.free_nodes, h.total_nodes)));
        }
        if u64::from(h.total_nodes)
            != u64::from(h.free_nodes) + u64::from(reachable) + u64::from(map_nodes) + 1
        {
            return Err(fail(
                0,
                "node_accounting",
                format!(
                    "total {} != free {} + reachable {reachable} + map {map_nodes} + header",
                    h.total_nodes, h.free_nodes
                ),
            ));
        }
        Ok(TreeCheck {
            depth: h.tree_depth,
            total_nodes: h.total_nodes,
            free_nodes: h.free_nodes,
            reachable,
            map_nodes,
            leaf_nodes,
            leaf_records,
        })
    }
}

/// Read the header record of node 0 without knowing the node size.
fn read_header(cache: &BufferCache, file: FileId, fork: &ExtentMap) -> BTreeResult<HeaderRecord> {
    let key = BufKey::new(file, 0);
    let at = |len: usize| {
        fork.map_range(0, u64::try_from(len).unwrap_or(u64::MAX))
            .map(ByteOffset)
            .ok_or_else(|| BTreeError::corrupt(file, 0, "header node not mapped"))
    };
    // a full-size node 0 may already be cached and pinned by the journal
    let mut guard = match cache.get(key, at(HINT_NODE_SIZE)?, HINT_NODE_SIZE, GetMode::Read) {
        Err(BlockCacheError::SizeMismatch { cached, .. }) => {
            cache.get(key, at(cached)?, cached, GetMode::Read)?
        }
        other => other?,
    };
    if NodeKind::from_raw(i8::from_ne_bytes([guard[8]])) != Some(NodeKind::Header) {
        trash(guard, file);
        return Err(BTreeError::corrupt(file, 0, "node 0 is not a header node"));
    }
    let native = Endian::Native.read_u16(&guard, NODE_SIZE_FIELD)?;
    let disk_order = guard.is_from_disk() || NodeSize::new(u32::from(native)).is_err();
    let node_size = if disk_order {
        Endian::Big.read_u16(&guard, NODE_SIZE_FIELD)?
    } else {
        native
    };

    if guard.len() == usize::from(node_size) {
        if disk_order {
            if let Err(err) = swap_node(&mut guard, SwapDirection::BigToHost, false) {
                error!(target: "hfs::btree", file = %file, %err, "btree_read_corrupt_node");
                trash(guard, file);
                return Err(BTreeError::corrupt(file, 0, err.0));
            }
        }
        return Ok(HeaderRecord::parse(&guard, Endian::Native)?);
    }

    // Partial read: convert just the header record, then drop the buffer so
    // the full node is read at its real size.
    if disk_order {
        if let Err(err) = swap_node(&mut guard, SwapDirection::HeaderRecordOnly, false) {
            trash(guard, file);
            return Err(BTreeError::corrupt(file, 0, err.0));
        }
    }
    let header = HeaderRecord::parse(&guard, Endian::Native);
    trash(guard, file);
    trace!(target: "hfs::btree", file = %file, node_size, "btree_header_hint_read");
    Ok(header?)
}

fn trash(guard: BufGuard, file: FileId) {
    if let Err(err) = guard.release(ReleaseMode::Trash) {
        warn!(target: "hfs::btree", file = %file, %err, "btree_trash_failed");
    }
}
