//! Insert, delete and replace.
//!
//! A change works on decoded copies of the nodes along one root-to-leaf
//! path and proceeds bottom up: the leaf is edited, then each parent takes
//! the consequences of its child (a new first key, a split-off sibling, a
//! merged-away sibling) until a level needs nothing more. Nodes leave the
//! tree only through the map, and sibling links are fixed in the same
//! transaction that splits or merges them.
//!
//! An insert reserves its free nodes before touching any node, so running
//! out of space leaves the tree as it was. If an operation fails later,
//! the in-memory header and extent map are restored but node writes
//! already made stay in the transaction; the caller has to undo its own
//! earlier changes or mark the volume inconsistent.

use crate::node::{Layout, Node, Record};
use crate::tree::{BTree, Level, TreeState};
use crate::{BTreeError, BTreeResult};
use hfs_journal::Transaction;
use hfs_ondisk::btree::MAX_TREE_DEPTH;
use hfs_ondisk::{ExtentMap, HeaderRecord, NodeDescriptor, NodeKind};
use tracing::{debug, error, trace};

struct Snapshot {
    header: HeaderRecord,
    fork: ExtentMap,
    fork_changed: bool,
}

impl Snapshot {
    fn take(st: &TreeState) -> Self {
        Self {
            header: st.header,
            fork: st.fork.clone(),
            fork_changed: st.fork_changed,
        }
    }

    fn restore(self, st: &mut TreeState) {
        st.header = self.header;
        st.fork = self.fork;
        st.fork_changed = self.fork_changed;
    }
}

fn fits_pair(lay: &Layout, kind: NodeKind, a: &[Record], b: &[Record]) -> bool {
    lay.used(kind, a) + lay.used(kind, b) <= lay.capacity()
}

impl BTree {
    /// Insert a new record. `key` is a complete key with its 16-bit length
    /// prefix, in disk order.
    pub fn insert(&self, txn: &mut Transaction<'_>, key: &[u8], data: &[u8]) -> BTreeResult<()> {
        let mut st = self.state.lock();
        let snapshot = Snapshot::take(&st);
        match self.insert_locked(txn, &mut st, key, data) {
            Ok(()) => {
                st.stats.inserts += 1;
                trace!(target: "hfs::btree", file = %self.file, key_len = key.len(), data_len = data.len(), "btree_insert");
                Ok(())
            }
            Err(err) => {
                snapshot.restore(&mut st);
                Err(err)
            }
        }
    }

    /// Remove the record with exactly `key`.
    pub fn delete(&self, txn: &mut Transaction<'_>, key: &[u8]) -> BTreeResult<()> {
        let mut st = self.state.lock();
        let snapshot = Snapshot::take(&st);
        match self.delete_locked(txn, &mut st, key) {
            Ok(()) => {
                st.stats.deletes += 1;
                trace!(target: "hfs::btree", file = %self.file, key_len = key.len(), "btree_delete");
                Ok(())
            }
            Err(err) => {
                snapshot.restore(&mut st);
                Err(err)
            }
        }
    }

    /// Overwrite the payload of the record with exactly `key`. A payload
    /// that no longer fits its node moves the record through a delete and
    /// insert under the same lock.
    pub fn replace(&self, txn: &mut Transaction<'_>, key: &[u8], data: &[u8]) -> BTreeResult<()> {
        let mut st = self.state.lock();
        let snapshot = Snapshot::take(&st);
        match self.replace_locked(txn, &mut st, key, data) {
            Ok(()) => {
                st.stats.replaces += 1;
                trace!(target: "hfs::btree", file = %self.file, key_len = key.len(), data_len = data.len(), "btree_replace");
                Ok(())
            }
            Err(err) => {
                snapshot.restore(&mut st);
                Err(err)
            }
        }
    }

    fn validate_record(&self, st: &TreeState, key: &[u8], data: &[u8]) -> BTreeResult<()> {
        let Some(prefix) = key.get(..2) else {
            return Err(BTreeError::InvalidKey("key shorter than its length field".into()));
        };
        let key_len = usize::from(u16::from_be_bytes([prefix[0], prefix[1]]));
        if key_len != key.len() - 2 {
            return Err(BTreeError::InvalidKey(format!(
                "length field {key_len} on a {}-byte key",
                key.len() - 2
            )));
        }
        if key_len > usize::from(st.header.max_key_length) {
            return Err(BTreeError::InvalidKey(format!(
                "key length {key_len} exceeds {}",
                st.header.max_key_length
            )));
        }
        let lay = self.layout(st);
        let leaf = Record {
            key: key.to_vec(),
            data: data.to_vec(),
        };
        let index = Record::index(key.to_vec(), 0);
        let cost = lay
            .record_cost(NodeKind::Leaf, &leaf)
            .max(lay.record_cost(NodeKind::Index, &index));
        if cost > lay.max_record_cost() {
            return Err(BTreeError::RecordTooLarge {
                len: key.len() + data.len(),
                max: lay.max_record_cost(),
            });
        }
        Ok(())
    }

    // ── Insert ──────────────────────────────────────────────────────────

    fn insert_locked(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
        key: &[u8],
        data: &[u8],
    ) -> BTreeResult<()> {
        self.validate_record(st, key, data)?;
        // one split per level plus a new root
        let needed = u32::from(st.header.tree_depth) + 1;
        self.ensure_free_nodes(txn, st, needed)?;

        let record = Record {
            key: key.to_vec(),
            data: data.to_vec(),
        };
        let Some(path) = self.descend(st, key)? else {
            return self.create_root_leaf(txn, st, record);
        };
        if path.found {
            return Err(BTreeError::Exists);
        }
        self.insert_along(txn, st, path.levels, record)?;
        st.header.leaf_records += 1;
        self.write_header(txn, st)
    }

    fn create_root_leaf(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
        record: Record,
    ) -> BTreeResult<()> {
        let num = self.allocate_node(txn, st)?;
        let node = Node {
            num,
            desc: NodeDescriptor {
                forward_link: 0,
                backward_link: 0,
                kind: NodeKind::Leaf,
                height: 1,
                num_records: 0,
            },
            records: vec![record],
        };
        self.write_node(txn, st, &node)?;
        let h = &mut st.header;
        h.root_node = num;
        h.first_leaf_node = num;
        h.last_leaf_node = num;
        h.tree_depth = 1;
        h.leaf_records = 1;
        debug!(target: "hfs::btree", file = %self.file, node = num, "btree_root_create");
        self.write_header(txn, st)
    }

    fn insert_along(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
        levels: Vec<Level>,
        record: Record,
    ) -> BTreeResult<()> {
        let lay = self.layout(st);
        let mut pending = Some(record);
        // consequences for the parent of the level just written
        let mut new_first: Option<Vec<u8>> = None;
        let mut sibling: Option<Record> = None;
        let mut split_root: Option<Node> = None;

        for (depth, Level { mut node, index }) in levels.into_iter().enumerate().rev() {
            let first_before = node.records.first().map(|r| r.key.clone());
            if let Some(rec) = pending.take() {
                node.records.insert(index, rec);
            } else {
                if new_first.is_none() && sibling.is_none() {
                    return Ok(());
                }
                if let Some(key) = new_first.take() {
                    node.records[index].key = key;
                }
                if let Some(rec) = sibling.take() {
                    node.records.insert(index + 1, rec);
                }
            }

            if !lay.fits(node.desc.kind, &node.records) {
                sibling = Some(self.split(txn, st, &lay, &mut node)?);
            }
            self.write_node(txn, st, &node)?;

            let first_after = &node.records[0].key;
            if depth == 0 {
                if sibling.is_some() {
                    split_root = Some(node);
                }
            } else if first_before.as_ref() != Some(first_after) {
                new_first = Some(first_after.clone());
            }
        }

        if let (Some(left), Some(right)) = (split_root, sibling) {
            self.grow_root(txn, st, &left, right)?;
        }
        Ok(())
    }

    /// Move the upper part of `node` into a new right sibling. Returns the
    /// index record for the new node.
    fn split(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
        lay: &Layout,
        node: &mut Node,
    ) -> BTreeResult<Record> {
        let kind = node.desc.kind;
        let Some(k) = lay.split_point(kind, &node.records) else {
            error!(target: "hfs::btree", file = %self.file, node = node.num, records = node.records.len(), invariant = "splittable_node", "btree_invariant_violation");
            return Err(BTreeError::corrupt(self.file, node.num, "records cannot be split into two nodes"));
        };
        let num = self.allocate_node(txn, st)?;
        let right = Node {
            num,
            desc: NodeDescriptor {
                forward_link: node.desc.forward_link,
                backward_link: node.num,
                kind,
                height: node.desc.height,
                num_records: 0,
            },
            records: node.records.split_off(k),
        };
        self.write_node(txn, st, &right)?;
        self.relink_next(txn, st, kind, num, right.desc.forward_link)?;
        node.desc.forward_link = num;
        st.stats.splits += 1;
        debug!(
            target: "hfs::btree",
            file = %self.file,
            node = node.num,
            new_node = num,
            kind = ?kind,
            left = node.records.len(),
            right = right.records.len(),
            "btree_node_split"
        );
        Ok(Record::index(right.records[0].key.clone(), num))
    }

    fn grow_root(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
        left: &Node,
        right: Record,
    ) -> BTreeResult<()> {
        if st.header.tree_depth >= MAX_TREE_DEPTH {
            error!(target: "hfs::btree", file = %self.file, depth = st.header.tree_depth, invariant = "max_tree_depth", "btree_invariant_violation");
            return Err(BTreeError::corrupt(self.file, left.num, "tree depth limit reached"));
        }
        let num = self.allocate_node(txn, st)?;
        let root = Node {
            num,
            desc: NodeDescriptor {
                forward_link: 0,
                backward_link: 0,
                kind: NodeKind::Index,
                height: left.desc.height.saturating_add(1),
                num_records: 0,
            },
            records: vec![Record::index(left.records[0].key.clone(), left.num), right],
        };
        self.write_node(txn, st, &root)?;
        st.header.root_node = num;
        st.header.tree_depth += 1;
        debug!(target: "hfs::btree", file = %self.file, node = num, depth = st.header.tree_depth, "btree_root_grow");
        Ok(())
    }

    /// Point `next` back at `node`, or make `node` the last leaf.
    fn relink_next(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
        kind: NodeKind,
        node: u32,
        next: u32,
    ) -> BTreeResult<()> {
        if next != 0 {
            self.set_links(txn, st, next, None, Some(node))
        } else {
            if kind == NodeKind::Leaf {
                st.header.last_leaf_node = node;
            }
            Ok(())
        }
    }

    // ── Delete ──────────────────────────────────────────────────────────

    fn delete_locked(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
        key: &[u8],
    ) -> BTreeResult<()> {
        let Some(path) = self.descend(st, key)? else {
            return Err(BTreeError::NotFound);
        };
        if !path.found {
            return Err(BTreeError::NotFound);
        }
        let mut levels = path.levels;
        if let Some(leaf) = levels.last_mut() {
            leaf.node.records.remove(leaf.index);
        }
        st.header.leaf_records = st.header.leaf_records.saturating_sub(1);
        self.rebalance(txn, st, levels)?;
        self.write_header(txn, st)
    }

    fn rebalance(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
        mut levels: Vec<Level>,
    ) -> BTreeResult<()> {
        let lay = self.layout(st);
        let mut li = levels.len().saturating_sub(1);
        while li > 0 {
            let (upper, lower) = levels.split_at_mut(li);
            let parent = &mut upper[li - 1];
            let node = &mut lower[0].node;
            if !self.settle_child(txn, st, &lay, parent, node)? {
                return Ok(());
            }
            li -= 1;
        }
        match levels.into_iter().next() {
            Some(root) => self.shrink_root(txn, st, root.node),
            None => Ok(()),
        }
    }

    /// Write an edited child and fold the result into its parent's copy.
    /// Returns whether the parent changed.
    fn settle_child(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
        lay: &Layout,
        parent: &mut Level,
        node: &mut Node,
    ) -> BTreeResult<bool> {
        let slot = parent.index;
        let kind = node.desc.kind;
        let siblings = &mut parent.node.records;

        if node.records.is_empty() {
            self.unlink(txn, st, node)?;
            self.free_node(txn, st, node.num)?;
            siblings.remove(slot);
            debug!(target: "hfs::btree", file = %self.file, node = node.num, kind = ?kind, "btree_node_remove");
            return Ok(true);
        }

        if lay.underfull(kind, &node.records) {
            let left = match slot.checked_sub(1) {
                Some(s) => Some(self.read_node(st, siblings[s].child())?),
                None => None,
            };
            if let Some(mut left) = left {
                if fits_pair(lay, kind, &left.records, &node.records) {
                    left.records.append(&mut node.records);
                    left.desc.forward_link = node.desc.forward_link;
                    self.write_node(txn, st, &left)?;
                    self.relink_next(txn, st, kind, left.num, left.desc.forward_link)?;
                    self.free_node(txn, st, node.num)?;
                    siblings.remove(slot);
                    st.stats.merges += 1;
                    debug!(target: "hfs::btree", file = %self.file, node = node.num, into = left.num, kind = ?kind, "btree_merge");
                    return Ok(true);
                }
                if slot + 1 >= siblings.len() {
                    self.redistribute(txn, st, lay, &mut left, node)?;
                    siblings[slot - 1].key = left.records[0].key.clone();
                    siblings[slot].key = node.records[0].key.clone();
                    return Ok(true);
                }
            }
            if let Some(next) = siblings.get(slot + 1).map(Record::child) {
                let mut right = self.read_node(st, next)?;
                if fits_pair(lay, kind, &node.records, &right.records) {
                    node.records.append(&mut right.records);
                    node.desc.forward_link = right.desc.forward_link;
                    self.write_node(txn, st, node)?;
                    self.relink_next(txn, st, kind, node.num, node.desc.forward_link)?;
                    self.free_node(txn, st, right.num)?;
                    siblings.remove(slot + 1);
                    siblings[slot].key = node.records[0].key.clone();
                    st.stats.merges += 1;
                    debug!(target: "hfs::btree", file = %self.file, node = right.num, into = node.num, kind = ?kind, "btree_merge");
                    return Ok(true);
                }
                self.redistribute(txn, st, lay, node, &mut right)?;
                siblings[slot].key = node.records[0].key.clone();
                siblings[slot + 1].key = right.records[0].key.clone();
                return Ok(true);
            }
        }

        self.write_node(txn, st, node)?;
        if siblings[slot].key != node.records[0].key {
            siblings[slot].key = node.records[0].key.clone();
            return Ok(true);
        }
        Ok(false)
    }

    /// Even out two adjacent siblings that do not fit in one node.
    fn redistribute(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
        lay: &Layout,
        left: &mut Node,
        right: &mut Node,
    ) -> BTreeResult<()> {
        let kind = left.desc.kind;
        let mut all = std::mem::take(&mut left.records);
        all.append(&mut right.records);
        let Some(k) = lay.split_point(kind, &all) else {
            error!(target: "hfs::btree", file = %self.file, node = left.num, invariant = "splittable_node", "btree_invariant_violation");
            return Err(BTreeError::corrupt(self.file, left.num, "siblings cannot be rebalanced"));
        };
        right.records = all.split_off(k);
        left.records = all;
        self.write_node(txn, st, left)?;
        self.write_node(txn, st, right)?;
        st.stats.redistributions += 1;
        debug!(
            target: "hfs::btree",
            file = %self.file,
            left = left.num,
            right = right.num,
            left_records = left.records.len(),
            right_records = right.records.len(),
            "btree_redistribute"
        );
        Ok(())
    }

    /// Take an empty node out of its sibling chain.
    fn unlink(&self, txn: &mut Transaction<'_>, st: &mut TreeState, node: &Node) -> BTreeResult<()> {
        let prev = node.desc.backward_link;
        let next = node.desc.forward_link;
        if prev != 0 {
            self.set_links(txn, st, prev, Some(next), None)?;
        }
        if next != 0 {
            self.set_links(txn, st, next, None, Some(prev))?;
        }
        if node.desc.kind == NodeKind::Leaf {
            if st.header.first_leaf_node == node.num {
                st.header.first_leaf_node = next;
            }
            if st.header.last_leaf_node == node.num {
                st.header.last_leaf_node = prev;
            }
        }
        Ok(())
    }

    /// Write the root, or drop it when it is empty or an index node with a
    /// single child.
    fn shrink_root(&self, txn: &mut Transaction<'_>, st: &mut TreeState, root: Node) -> BTreeResult<()> {
        if root.records.is_empty() {
            self.free_node(txn, st, root.num)?;
            let h = &mut st.header;
            h.root_node = 0;
            h.tree_depth = 0;
            h.first_leaf_node = 0;
            h.last_leaf_node = 0;
            debug!(target: "hfs::btree", file = %self.file, node = root.num, "btree_tree_empty");
            return Ok(());
        }
        let mut root = root;
        if !(root.desc.kind == NodeKind::Index && root.records.len() == 1) {
            return self.write_node(txn, st, &root);
        }
        while root.desc.kind == NodeKind::Index && root.records.len() == 1 {
            let child = root.records[0].child();
            self.free_node(txn, st, root.num)?;
            st.header.root_node = child;
            st.header.tree_depth = st.header.tree_depth.saturating_sub(1);
            debug!(target: "hfs::btree", file = %self.file, old_root = root.num, node = child, depth = st.header.tree_depth, "btree_root_collapse");
            root = self.read_node(st, child)?;
        }
        Ok(())
    }

    // ── Replace ─────────────────────────────────────────────────────────

    fn replace_locked(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
        key: &[u8],
        data: &[u8],
    ) -> BTreeResult<()> {
        self.validate_record(st, key, data)?;
        let Some(path) = self.descend(st, key)? else {
            return Err(BTreeError::NotFound);
        };
        if !path.found {
            return Err(BTreeError::NotFound);
        }
        let Some(Level { mut node, index }) = path.levels.into_iter().last() else {
            return Err(BTreeError::NotFound);
        };
        node.records[index].data = data.to_vec();
        if self.layout(st).fits(node.desc.kind, &node.records) {
            return self.write_node(txn, st, &node);
        }
        self.delete_locked(txn, st, key)?;
        self.insert_locked(txn, st, key, data)
    }
}
