//! Fork extent resolution through the extents-overflow tree.

use crate::parse_error;
use hfs_btree::BTree;
use hfs_error::{HfsError, Result};
use hfs_ondisk::{ExtentKey, ExtentMap, ExtentRecord, ForkData};
use hfs_ondisk::extents::{FORK_DATA, FORK_RESOURCE};
use hfs_types::Cnid;
use tracing::{error, trace};

/// Which fork of a file an extent list belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkKind {
    Data,
    Resource,
}

impl ForkKind {
    fn raw(self) -> u8 {
        match self {
            Self::Data => FORK_DATA,
            Self::Resource => FORK_RESOURCE,
        }
    }
}

/// Full extent map of `fork`: the inline extents, then overflow records
/// keyed by the file allocation block each one starts at.
pub fn resolve_fork(
    extents: Option<&BTree>,
    cnid: Cnid,
    kind: ForkKind,
    fork: &ForkData,
    block_size: u32,
    volume_offset: u64,
) -> Result<ExtentMap> {
    let mut map = ExtentMap::from_fork(block_size, volume_offset, fork);
    let want = u64::from(fork.total_blocks);
    let mut have = fork.inline_blocks();
    if have >= want {
        return Ok(map);
    }
    let Some(tree) = extents else {
        return Err(missing_overflow(cnid, have, want));
    };

    while have < want {
        let start_block = u32::try_from(have).map_err(|_| missing_overflow(cnid, have, want))?;
        let key = ExtentKey {
            fork_type: kind.raw(),
            file_id: cnid,
            start_block,
        };
        let Some(data) = tree.lookup(&key.encode())? else {
            return Err(missing_overflow(cnid, have, want));
        };
        let record = ExtentRecord::parse(&data).map_err(parse_error)?;
        let blocks = record.blocks();
        if blocks == 0 {
            return Err(missing_overflow(cnid, have, want));
        }
        for extent in record.0.into_iter().filter(|e| !e.is_empty()) {
            map.push(extent);
        }
        trace!(target: "hfs::volume", cnid = cnid.0, start_block, blocks, "fork_overflow_record");
        have += blocks;
    }
    Ok(map)
}

/// Every overflow record of a fork, in file order, with its key.
pub fn overflow_records(
    extents: &BTree,
    cnid: Cnid,
    kind: ForkKind,
) -> Result<Vec<(ExtentKey, ExtentRecord)>> {
    let first = ExtentKey {
        fork_type: kind.raw(),
        file_id: cnid,
        start_block: 0,
    };
    let mut found = Vec::new();
    let mut failure = None;
    extents.scan_from(&first.encode(), |key, data| {
        let parsed = ExtentKey::parse(key).and_then(|k| Ok((k, ExtentRecord::parse(data)?)));
        match parsed {
            Ok((k, _)) if k.file_id != cnid || k.fork_type != kind.raw() => false,
            Ok(pair) => {
                found.push(pair);
                true
            }
            Err(err) => {
                failure = Some(err);
                false
            }
        }
    })?;
    match failure {
        Some(err) => Err(parse_error(err)),
        None => Ok(found),
    }
}

fn missing_overflow(cnid: Cnid, have: u64, want: u64) -> HfsError {
    error!(target: "hfs::volume", cnid = cnid.0, have, want, "fork_overflow_missing");
    HfsError::Corruption {
        block: 0,
        detail: format!("fork of CNID {} maps {have} of {want} blocks", cnid.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfs_ondisk::ExtentDescriptor;

    #[test]
    fn inline_fork_needs_no_tree() {
        let mut fork = ForkData {
            total_blocks: 12,
            ..ForkData::default()
        };
        fork.extents[0] = ExtentDescriptor::new(10, 4);
        fork.extents[1] = ExtentDescriptor::new(40, 8);
        let map = resolve_fork(None, Cnid::CATALOG_FILE, ForkKind::Data, &fork, 4096, 0)
            .expect("resolve");
        assert_eq!(map.total_blocks(), 12);
    }

    #[test]
    fn short_fork_without_tree_is_corruption() {
        let mut fork = ForkData {
            total_blocks: 20,
            ..ForkData::default()
        };
        fork.extents[0] = ExtentDescriptor::new(10, 4);
        let err = resolve_fork(None, Cnid::CATALOG_FILE, ForkKind::Data, &fork, 4096, 0)
            .expect_err("short");
        assert!(err.is_corruption());
    }
}
