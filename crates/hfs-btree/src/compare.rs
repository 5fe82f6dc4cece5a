//! Key comparators.
//!
//! Keys reach a comparator exactly as stored in a record, in disk order
//! with their 16-bit length prefix. Comparators never fail: a truncated key
//! compares as if its missing fields were zero, so a damaged node yields a
//! wrong order that the structural checks report, never a panic.

use hfs_ondisk::btree::{KEY_COMPARE_BINARY, KEY_COMPARE_CASE_FOLD};
use hfs_types::FileId;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Total order over the keys of one tree.
pub trait KeyComparator: Send + Sync + fmt::Debug {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// `keyCompareType` recorded in the header of a tree using this order.
    fn compare_type(&self) -> u8 {
        0
    }
}

fn be16(key: &[u8], at: usize) -> u16 {
    match key.get(at..at + 2) {
        Some(b) => u16::from_be_bytes([b[0], b[1]]),
        None => 0,
    }
}

fn be32(key: &[u8], at: usize) -> u32 {
    match key.get(at..at + 4) {
        Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        None => 0,
    }
}

/// UTF-16 units of a length-prefixed name starting at `at`.
fn units(key: &[u8], at: usize) -> impl Iterator<Item = u16> + '_ {
    let len = usize::from(be16(key, at));
    let body = key.get(at + 2..).unwrap_or(&[]);
    body.chunks_exact(2)
        .take(len)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
}

fn fold(unit: u16) -> u16 {
    let Some(c) = char::from_u32(u32::from(unit)) else {
        return unit;
    };
    let mut lower = c.to_lowercase();
    match (lower.next(), lower.next()) {
        (Some(l), None) => u16::try_from(u32::from(l)).unwrap_or(unit),
        _ => unit,
    }
}

/// Case-insensitive name order: case folded, NUL units ignored.
fn compare_folded(a: impl Iterator<Item = u16>, b: impl Iterator<Item = u16>) -> Ordering {
    let a = a.filter(|&u| u != 0).map(fold);
    let b = b.filter(|&u| u != 0).map(fold);
    a.cmp(b)
}

// ── Generic ────────────────────────────────────────────────────────────────

/// Bytewise order of the key bodies; shorter keys sort first on a tie.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryKeys;

impl KeyComparator for BinaryKeys {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        fn body(k: &[u8]) -> &[u8] {
            let len = usize::from(be16(k, 0));
            k.get(2..).map_or(&[][..], |rest| &rest[..len.min(rest.len())])
        }
        body(a).cmp(body(b))
    }
}

// ── Catalog ────────────────────────────────────────────────────────────────

/// `(parentID, nodeName)` order of the catalog tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct CatalogKeys {
    /// HFSX binary name order instead of case folding.
    pub case_sensitive: bool,
}

impl KeyComparator for CatalogKeys {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        be32(a, 2).cmp(&be32(b, 2)).then_with(|| {
            if self.case_sensitive {
                units(a, 6).cmp(units(b, 6))
            } else {
                compare_folded(units(a, 6), units(b, 6))
            }
        })
    }

    fn compare_type(&self) -> u8 {
        if self.case_sensitive {
            KEY_COMPARE_BINARY
        } else {
            KEY_COMPARE_CASE_FOLD
        }
    }
}

// ── Extents ────────────────────────────────────────────────────────────────

/// `(fileID, forkType, startBlock)` order of the extents-overflow tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtentKeys;

impl KeyComparator for ExtentKeys {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let fork = |k: &[u8]| k.get(2).copied().unwrap_or(0);
        be32(a, 4)
            .cmp(&be32(b, 4))
            .then_with(|| fork(a).cmp(&fork(b)))
            .then_with(|| be32(a, 8).cmp(&be32(b, 8)))
    }
}

// ── Attributes ─────────────────────────────────────────────────────────────

/// `(fileID, name, startBlock)` order of the attributes tree; names compare
/// as binary UTF-16.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttributeKeys;

impl KeyComparator for AttributeKeys {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        be32(a, 4)
            .cmp(&be32(b, 4))
            .then_with(|| units(a, 12).cmp(units(b, 12)))
            .then_with(|| be32(a, 8).cmp(&be32(b, 8)))
    }

    fn compare_type(&self) -> u8 {
        KEY_COMPARE_BINARY
    }
}

/// Comparator for a special file, honoring the catalog's
/// `keyCompareType`.
#[must_use]
pub fn for_file(file: FileId, key_compare_type: u8) -> Arc<dyn KeyComparator> {
    match file {
        FileId::CATALOG => Arc::new(CatalogKeys {
            case_sensitive: key_compare_type == KEY_COMPARE_BINARY,
        }),
        FileId::EXTENTS => Arc::new(ExtentKeys),
        FileId::ATTRIBUTES => Arc::new(AttributeKeys),
        _ => Arc::new(BinaryKeys),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfs_ondisk::{AttributeKey, CatalogKey, ExtentKey, UniName};
    use hfs_types::Cnid;

    fn cat(parent: u32, name: &str) -> Vec<u8> {
        CatalogKey::new(Cnid(parent), UniName::from_str_lossless(name).expect("name")).encode()
    }

    #[test]
    fn catalog_orders_parent_then_name() {
        let cmp = CatalogKeys::default();
        assert_eq!(cmp.compare(&cat(2, "zeta"), &cat(3, "alpha")), Ordering::Less);
        assert_eq!(cmp.compare(&cat(2, "alpha"), &cat(2, "beta")), Ordering::Less);
        assert_eq!(cmp.compare(&cat(2, "ab"), &cat(2, "abc")), Ordering::Less);
        // thread keys (empty name) sort before every named child
        assert_eq!(cmp.compare(&cat(2, ""), &cat(2, "a")), Ordering::Less);
    }

    #[test]
    fn catalog_case_folding() {
        let folded = CatalogKeys::default();
        assert_eq!(folded.compare(&cat(2, "README"), &cat(2, "readme")), Ordering::Equal);
        assert_eq!(folded.compare_type(), KEY_COMPARE_CASE_FOLD);
        let binary = CatalogKeys {
            case_sensitive: true,
        };
        assert_eq!(binary.compare(&cat(2, "README"), &cat(2, "readme")), Ordering::Less);
        assert_eq!(binary.compare_type(), KEY_COMPARE_BINARY);
    }

    #[test]
    fn extent_order_is_file_fork_start() {
        let key = |fork: u8, file: u32, start: u32| {
            ExtentKey {
                fork_type: fork,
                file_id: Cnid(file),
                start_block: start,
            }
            .encode()
        };
        let cmp = ExtentKeys;
        assert_eq!(cmp.compare(&key(0xFF, 20, 0), &key(0, 21, 0)), Ordering::Less);
        assert_eq!(cmp.compare(&key(0, 20, 99), &key(0xFF, 20, 0)), Ordering::Less);
        assert_eq!(cmp.compare(&key(0, 20, 8), &key(0, 20, 16)), Ordering::Less);
    }

    #[test]
    fn attribute_order_is_file_name_start() {
        let key = |file: u32, name: &str| AttributeKey::new(Cnid(file), name).expect("key").encode();
        let cmp = AttributeKeys;
        assert_eq!(cmp.compare(&key(30, "z"), &key(31, "a")), Ordering::Less);
        assert_eq!(cmp.compare(&key(30, "com.b"), &key(30, "com.a")), Ordering::Greater);
        assert_eq!(cmp.compare(&key(30, "x"), &key(30, "x")), Ordering::Equal);
    }

    #[test]
    fn truncated_keys_do_not_panic() {
        let cmp = CatalogKeys::default();
        let _ = cmp.compare(&[0, 200, 1], &cat(1, "a"));
        let _ = AttributeKeys.compare(&[], &[0xFF; 3]);
        assert_eq!(BinaryKeys.compare(&[0, 9, 1], &[0, 1, 1]), Ordering::Equal);
    }
}
