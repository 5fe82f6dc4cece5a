//! Tree file growth and creation of new trees.
//!
//! A tree file only grows, and always by whole nodes: node `n` lives at
//! byte `n * nodeSize`, so a file length that is not a node multiple would
//! leave a partial node the map could hand out. Growth asks the allocator
//! for a clump-sized contiguous run near the end of the file and halves the
//! request on every failure, giving up below one node.

use crate::compare::{AttributeKeys, KeyComparator};
use crate::map::{header_map_len, init_map_node, map_node_len};
use crate::tree::{BTree, TreeState};
use crate::{BTreeError, BTreeResult};
use hfs_alloc::bitmap::set_bits;
use hfs_alloc::{AllocRequest, Allocator, AllocatorError};
use hfs_block::BufferCache;
use hfs_journal::Transaction;
use hfs_ondisk::attributes::ATTR_KEY_MAX_LENGTH;
use hfs_ondisk::btree::{
    BTREE_TYPE_HFS, BTREE_TYPE_RESERVED, HEADER_MAP_RECORD_OFFSET, HEADER_NODE_RECORDS,
    KEY_COMPARE_BINARY, KEY_COMPARE_CASE_FOLD, USER_DATA_RECORD_SIZE,
};
use hfs_ondisk::catalog::CATALOG_KEY_MAX_LENGTH;
use hfs_ondisk::extents::EXTENT_KEY_LENGTH;
use hfs_ondisk::{
    BTreeAttributes, EXTENT_DENSITY, Endian, ExtentMap, HEADER_RECORD_SIZE, HeaderRecord,
    NODE_DESCRIPTOR_SIZE, NodeDescriptor, NodeKind,
};
use hfs_types::{FileId, NodeSize};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cap on the catalog-derived size of a new attributes tree.
const ATTR_TREE_SIZE_CAP: u64 = 20 * 1024 * 1024;

/// Shape of a tree to be formatted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeParams {
    pub node_size: u16,
    pub max_key_length: u16,
    pub btree_type: u8,
    pub key_compare_type: u8,
    pub attributes: BTreeAttributes,
    /// Bytes the file grows by at a time.
    ///
    /// Default: eight nodes.
    pub clump_size: u32,
}

impl TreeParams {
    fn base(node_size: u16, max_key_length: u16) -> Self {
        Self {
            node_size,
            max_key_length,
            btree_type: BTREE_TYPE_HFS,
            key_compare_type: 0,
            attributes: BTreeAttributes(BTreeAttributes::BIG_KEYS.0),
            clump_size: u32::from(node_size) * 8,
        }
    }

    #[must_use]
    pub fn catalog(node_size: u16, case_sensitive: bool) -> Self {
        Self {
            key_compare_type: if case_sensitive {
                KEY_COMPARE_BINARY
            } else {
                KEY_COMPARE_CASE_FOLD
            },
            attributes: BTreeAttributes(
                BTreeAttributes::BIG_KEYS.0 | BTreeAttributes::VARIABLE_INDEX_KEYS.0,
            ),
            ..Self::base(node_size, CATALOG_KEY_MAX_LENGTH)
        }
    }

    #[must_use]
    pub fn extents(node_size: u16) -> Self {
        Self::base(node_size, EXTENT_KEY_LENGTH)
    }

    #[must_use]
    pub fn attributes(node_size: u16) -> Self {
        Self {
            btree_type: BTREE_TYPE_RESERVED,
            key_compare_type: KEY_COMPARE_BINARY,
            attributes: BTreeAttributes(
                BTreeAttributes::BIG_KEYS.0 | BTreeAttributes::VARIABLE_INDEX_KEYS.0,
            ),
            ..Self::base(node_size, ATTR_KEY_MAX_LENGTH)
        }
    }

    #[must_use]
    pub fn with_clump_size(mut self, bytes: u32) -> Self {
        self.clump_size = bytes;
        self
    }

    /// Header record of an empty tree of `total_nodes` nodes.
    fn header(&self, total_nodes: u32, free_nodes: u32) -> HeaderRecord {
        HeaderRecord {
            tree_depth: 0,
            root_node: 0,
            leaf_records: 0,
            first_leaf_node: 0,
            last_leaf_node: 0,
            node_size: self.node_size,
            max_key_length: self.max_key_length,
            total_nodes,
            free_nodes,
            clump_size: self.clump_size,
            btree_type: self.btree_type,
            key_compare_type: self.key_compare_type,
            attributes: self.attributes,
        }
    }
}

/// Node count for a new attributes tree: a fifth of the catalog (at most
/// 20 MiB), no less than the catalog clump, no more than a tenth of the
/// free space, and never fewer than two nodes.
#[must_use]
pub fn default_attribute_node_count(
    catalog_size: u64,
    catalog_clump: u32,
    free_bytes: u64,
    node_size: u16,
) -> u32 {
    let bytes = (catalog_size / 5)
        .min(ATTR_TREE_SIZE_CAP)
        .max(u64::from(catalog_clump))
        .min(free_bytes / 10);
    let nodes = bytes / u64::from(node_size.max(1));
    u32::try_from(nodes).unwrap_or(u32::MAX).max(2)
}

/// Map nodes a tree of `total_nodes` needs beyond the header map record.
fn map_nodes_needed(total_nodes: u32, node_size: usize) -> u32 {
    let header_bits = u32::try_from(header_map_len(node_size) * 8).unwrap_or(u32::MAX);
    let node_bits = u32::try_from(map_node_len(node_size) * 8).unwrap_or(u32::MAX);
    if total_nodes > header_bits {
        (total_nodes - header_bits).div_ceil(node_bits)
    } else {
        0
    }
}

impl BTree {
    /// Format an empty tree over the already allocated `fork`.
    pub fn format(
        txn: &mut Transaction<'_>,
        cache: BufferCache,
        file: FileId,
        fork: ExtentMap,
        params: &TreeParams,
        comparator: Arc<dyn KeyComparator>,
        allocator: Option<Allocator>,
    ) -> BTreeResult<Self> {
        NodeSize::new(u32::from(params.node_size))?;
        let tree = Self::from_parts(cache, file, fork, params.header(0, 0), comparator, allocator);
        {
            let mut st = tree.state.lock();
            tree.format_locked(txn, &mut st, params)?;
        }
        Ok(tree)
    }

    /// Allocate a clump for a new tree file and format it.
    pub fn create(
        txn: &mut Transaction<'_>,
        cache: BufferCache,
        file: FileId,
        allocator: Allocator,
        params: &TreeParams,
        comparator: Arc<dyn KeyComparator>,
    ) -> BTreeResult<Self> {
        NodeSize::new(u32::from(params.node_size))?;
        let geometry = allocator.geometry();
        let fork = ExtentMap::new(geometry.block_size, geometry.volume_offset, Vec::new());
        let tree = Self::from_parts(cache, file, fork, params.header(0, 0), comparator, Some(allocator));
        {
            let mut st = tree.state.lock();
            tree.grow_fork(txn, &mut st, u64::from(params.node_size))?;
            tree.format_locked(txn, &mut st, params)?;
            st.fork_changed = true;
        }
        Ok(tree)
    }

    /// Create the attributes tree with `node_count` nodes' worth of clump.
    pub fn create_attributes(
        txn: &mut Transaction<'_>,
        cache: BufferCache,
        allocator: Allocator,
        node_size: u16,
        node_count: u32,
    ) -> BTreeResult<Self> {
        if allocator.free_blocks() == 0 {
            warn!(target: "hfs::btree", "btree_attributes_no_space");
            return Err(BTreeError::NoSpace);
        }
        let params = TreeParams::attributes(node_size)
            .with_clump_size(u32::from(node_size).saturating_mul(node_count));
        let tree = Self::create(
            txn,
            cache,
            FileId::ATTRIBUTES,
            allocator,
            &params,
            Arc::new(AttributeKeys),
        )?;
        let header = tree.header();
        info!(
            target: "hfs::btree",
            node_size,
            total_nodes = header.total_nodes,
            free_nodes = header.free_nodes,
            "btree_attributes_created"
        );
        Ok(tree)
    }

    /// Write the header node and map nodes of an empty tree spanning the
    /// whole file.
    fn format_locked(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
        params: &TreeParams,
    ) -> BTreeResult<()> {
        let ns = usize::from(params.node_size);
        let total = u32::try_from(st.fork.physical_len() / u64::from(params.node_size))
            .map_err(|_| BTreeError::corrupt(self.file, 0, "tree file too large"))?;
        let map_nodes = map_nodes_needed(total, ns);
        if total < map_nodes + 1 {
            return Err(BTreeError::NoSpace);
        }
        st.header = params.header(total, total - 1 - map_nodes);

        let mut node = vec![0; ns];
        NodeDescriptor {
            forward_link: u32::from(map_nodes > 0),
            backward_link: 0,
            kind: NodeKind::Header,
            height: 0,
            num_records: HEADER_NODE_RECORDS,
        }
        .encode(&mut node, Endian::Native)?;
        st.header.encode(&mut node, Endian::Native)?;
        let user = NODE_DESCRIPTOR_SIZE + HEADER_RECORD_SIZE;
        let offsets = [
            NODE_DESCRIPTOR_SIZE,
            user,
            user + USER_DATA_RECORD_SIZE,
            HEADER_MAP_RECORD_OFFSET + header_map_len(ns),
        ];
        for (i, off) in offsets.into_iter().enumerate() {
            let off = u16::try_from(off).unwrap_or(u16::MAX);
            Endian::Native.write_u16(&mut node, ns - 2 * (i + 1), off)?;
        }
        let used = usize::try_from(map_nodes + 1).unwrap_or(usize::MAX);
        set_bits(&mut node[HEADER_MAP_RECORD_OFFSET..], 0, used);
        self.write_raw(txn, st, 0, &node)?;

        for num in 1..=map_nodes {
            init_map_node(&mut node)?;
            if num != map_nodes {
                Endian::Native.write_u32(&mut node, 0, num + 1)?;
            }
            self.write_raw(txn, st, num, &node)?;
        }
        info!(
            target: "hfs::btree",
            file = %self.file,
            node_size = ns,
            total_nodes = total,
            map_nodes,
            "btree_format"
        );
        Ok(())
    }

    // ── Growth ──────────────────────────────────────────────────────────

    /// Grow the tree file to at least `min_eof` bytes and add the new nodes
    /// to the header and map.
    pub fn extend(&self, txn: &mut Transaction<'_>, min_eof: u64) -> BTreeResult<()> {
        let mut st = self.state.lock();
        let saved = (st.header, st.fork.clone(), st.fork_changed);
        let result = self
            .extend_file(txn, &mut st, min_eof)
            .and_then(|()| self.write_header(txn, &st));
        if result.is_err() {
            (st.header, st.fork, st.fork_changed) = saved;
        }
        result
    }

    pub(crate) fn extend_file(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
        min_eof: u64,
    ) -> BTreeResult<()> {
        let added = self.grow_fork(txn, st, min_eof)?;
        if added == 0 {
            return Ok(());
        }
        st.header.total_nodes += added;
        st.header.free_nodes += added;
        st.fork_changed = true;
        st.stats.extends += 1;
        self.ensure_map_capacity(txn, st)?;
        debug!(
            target: "hfs::btree",
            file = %self.file,
            added,
            total_nodes = st.header.total_nodes,
            free_nodes = st.header.free_nodes,
            extents = st.fork.extents().len(),
            "btree_extend"
        );
        Ok(())
    }

    /// Make at least `needed` nodes free, growing the file if necessary.
    pub(crate) fn ensure_free_nodes(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
        needed: u32,
    ) -> BTreeResult<()> {
        let ns = u64::from(st.header.node_size);
        while st.header.free_nodes < needed {
            // one more for a map node the growth may need
            let missing = u64::from(needed - st.header.free_nodes) + 1;
            let min_eof = (u64::from(st.header.total_nodes) + missing) * ns;
            self.extend_file(txn, st, min_eof)?;
        }
        Ok(())
    }

    /// Allocate blocks until the file is at least `min_eof` bytes long.
    /// Returns the number of whole nodes added. On failure every block
    /// taken here is given back.
    fn grow_fork(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
        min_eof: u64,
    ) -> BTreeResult<u32> {
        let Some(allocator) = self.allocator.as_ref() else {
            warn!(target: "hfs::btree", file = %self.file, "btree_extend_without_allocator");
            return Err(BTreeError::NoSpace);
        };
        let ns = u64::from(st.header.node_size);
        let bs = u64::from(st.fork.block_size());
        let unit = ns.max(bs);
        let orig = st.fork.physical_len();
        if min_eof <= orig {
            return Ok(0);
        }

        let mut chunk = (min_eof - orig)
            .max(u64::from(st.header.clump_size))
            .next_multiple_of(unit);
        let mut eof = orig;
        while eof < min_eof {
            let blocks = u32::try_from(chunk / bs).unwrap_or(u32::MAX);
            let mut request = AllocRequest::exact(blocks);
            if let Some(last) = st.fork.extents().last() {
                request = request.at(last.end_block());
            }
            match allocator.allocate(txn, request) {
                Ok(run) => {
                    st.fork.push(run);
                    eof += u64::from(run.block_count) * bs;
                }
                Err(AllocatorError::NoSpace { .. }) => {
                    chunk = chunk / 2 / unit * unit;
                    if chunk < unit {
                        break;
                    }
                }
                Err(err) => {
                    self.give_back(txn, st, allocator, orig)?;
                    return Err(err.into());
                }
            }
        }

        if eof < min_eof {
            warn!(target: "hfs::btree", file = %self.file, have = eof, want = min_eof, "btree_extend_failed");
            self.give_back(txn, st, allocator, orig)?;
            return Err(BTreeError::NoSpace);
        }
        if self.file == FileId::EXTENTS && st.fork.extents().len() > EXTENT_DENSITY {
            warn!(target: "hfs::btree", extents = st.fork.extents().len(), "btree_extents_file_fragmented");
            self.give_back(txn, st, allocator, orig)?;
            return Err(BTreeError::ExtentsFull(self.file));
        }
        u32::try_from((eof - orig) / ns)
            .map_err(|_| BTreeError::corrupt(self.file, 0, "tree file too large"))
    }

    /// Truncate the fork back to `orig` bytes and free what was cut.
    fn give_back(
        &self,
        txn: &mut Transaction<'_>,
        st: &mut TreeState,
        allocator: &Allocator,
        orig: u64,
    ) -> BTreeResult<()> {
        let bs = u64::from(st.fork.block_size());
        let extra = (st.fork.physical_len() - orig) / bs;
        for run in st.fork.truncate_blocks(extra) {
            allocator.free(txn, run)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_node_count_bounds() {
        let mib = 1024 * 1024;
        // a fifth of a 10 MiB catalog
        assert_eq!(default_attribute_node_count(10 * mib, 4096, 1 << 40, 4096), 512);
        // capped at 20 MiB
        assert_eq!(default_attribute_node_count(500 * mib, 4096, 1 << 40, 4096), 5120);
        // raised to the catalog clump
        assert_eq!(default_attribute_node_count(4096, 64 * 4096, 1 << 40, 4096), 64);
        // limited by free space, never below two nodes
        assert_eq!(default_attribute_node_count(10 * mib, 4096, 100 * 4096, 4096), 10);
        assert_eq!(default_attribute_node_count(10 * mib, 4096, 0, 4096), 2);
    }

    #[test]
    fn map_nodes_for_large_trees() {
        // header map record of a 512-byte node covers 2048 nodes
        assert_eq!(map_nodes_needed(2048, 512), 0);
        assert_eq!(map_nodes_needed(2049, 512), 1);
        // each 512-byte map node covers 3936 more
        assert_eq!(map_nodes_needed(2048 + 3936, 512), 1);
        assert_eq!(map_nodes_needed(2048 + 3937, 512), 2);
        assert_eq!(map_nodes_needed(12_500, 4096), 0);
    }

    #[test]
    fn params_per_tree() {
        let cat = TreeParams::catalog(4096, false);
        assert_eq!(cat.max_key_length, 516);
        assert_eq!(cat.key_compare_type, KEY_COMPARE_CASE_FOLD);
        assert!(cat.attributes.contains(BTreeAttributes::VARIABLE_INDEX_KEYS));
        let ext = TreeParams::extents(512);
        assert_eq!(ext.max_key_length, 10);
        assert!(!ext.attributes.contains(BTreeAttributes::VARIABLE_INDEX_KEYS));
        let attr = TreeParams::attributes(4096).with_clump_size(4096 * 10);
        assert_eq!(attr.btree_type, 0xFF);
        assert_eq!(attr.max_key_length, 266);
        assert_eq!(attr.clump_size, 40960);
    }
}
