//! Catalog operations: lookup, create and delete of files and folders.
//!
//! Every file and folder has two catalog records: the record itself keyed
//! by `(parent, name)` and a thread record keyed by `(cnid, "")` that
//! points back at the parent and name. Create and delete keep both, the
//! parent's valence, and the volume's file and folder counts in step
//! inside one journal transaction.

use crate::forks::{ForkKind, overflow_records};
use crate::parse_error;
use crate::state::{InconsistentReason, VolumeOp};
use crate::volume::Volume;
use hfs_error::{HfsError, Result};
use hfs_journal::Transaction;
use hfs_ondisk::{
    CatalogKey, CatalogRecord, FileRecord, FolderRecord, ForkData, ThreadRecord, UniName,
    VolumeAttributes,
};
use hfs_types::Cnid;
use tracing::{debug, info, warn};

/// One child of a folder, as returned by [`Volume::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub cnid: Cnid,
    pub record: CatalogRecord,
}

impl CatalogEntry {
    #[must_use]
    pub fn is_folder(&self) -> bool {
        matches!(self.record, CatalogRecord::Folder(_))
    }
}

fn catalog_name(name: &str) -> Result<UniName> {
    if name.is_empty() {
        return Err(HfsError::InvalidArgument("empty name".to_owned()));
    }
    UniName::from_str_lossless(name).map_err(|_| HfsError::NameTooLong)
}

fn not_found(what: impl std::fmt::Display) -> HfsError {
    HfsError::NotFound(what.to_string())
}

impl Volume {
    // ── Reads ───────────────────────────────────────────────────────────

    /// The record named `name` in folder `parent`.
    pub fn lookup(&self, parent: Cnid, name: &str) -> Result<Option<CatalogRecord>> {
        let key = CatalogKey::new(parent, catalog_name(name)?);
        self.lookup_key(&key)
    }

    /// The key and record of `cnid`, found through its thread record.
    pub fn lookup_by_cnid(&self, cnid: Cnid) -> Result<Option<(CatalogKey, CatalogRecord)>> {
        let Some(thread) = self.thread_of(cnid)? else {
            return Ok(None);
        };
        let key = CatalogKey::new(thread.parent_id, thread.name);
        match self.lookup_key(&key)? {
            Some(record) if record.cnid() == Some(cnid) => Ok(Some((key, record))),
            _ => {
                warn!(target: "hfs::volume", cnid = cnid.0, parent = key.parent_id.0, "catalog_thread_dangling");
                Err(HfsError::Corruption {
                    block: 0,
                    detail: format!("thread record of CNID {} names no matching record", cnid.0),
                })
            }
        }
    }

    /// Children of `parent` in catalog key order.
    pub fn list(&self, parent: Cnid) -> Result<Vec<CatalogEntry>> {
        let start = CatalogKey::thread(parent).encode();
        let mut entries = Vec::new();
        let mut failure = None;
        self.catalog.scan_from(&start, |key, data| {
            let parsed = CatalogKey::parse(key).and_then(|k| Ok((k, CatalogRecord::parse(data)?)));
            match parsed {
                Ok((k, _)) if k.parent_id != parent => false,
                Ok((_, record)) if record.is_thread() => true,
                Ok((k, record)) => {
                    if let Some(cnid) = record.cnid() {
                        entries.push(CatalogEntry {
                            name: k.name.to_string(),
                            cnid,
                            record,
                        });
                    }
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
            None => Ok(entries),
        }
    }

    fn lookup_key(&self, key: &CatalogKey) -> Result<Option<CatalogRecord>> {
        self.catalog
            .lookup(&key.encode())?
            .map(|data| CatalogRecord::parse(&data).map_err(parse_error))
            .transpose()
    }

    fn thread_of(&self, cnid: Cnid) -> Result<Option<ThreadRecord>> {
        match self.lookup_key(&CatalogKey::thread(cnid))? {
            None => Ok(None),
            Some(CatalogRecord::FolderThread(t) | CatalogRecord::FileThread(t)) => Ok(Some(t)),
            Some(_) => Err(HfsError::Corruption {
                block: 0,
                detail: format!("thread key of CNID {} holds a non-thread record", cnid.0),
            }),
        }
    }

    // ── Create ──────────────────────────────────────────────────────────

    pub fn create_folder(&self, parent: Cnid, name: &str) -> Result<Cnid> {
        self.create_node(parent, name, true)
    }

    pub fn create_file(&self, parent: Cnid, name: &str) -> Result<Cnid> {
        self.create_node(parent, name, false)
    }

    fn create_node(&self, parent: Cnid, name: &str, folder: bool) -> Result<Cnid> {
        let uname = catalog_name(name)?;
        let key = CatalogKey::new(parent, uname.clone());
        self.write_transaction(|txn| {
            let (parent_key, mut parent_rec) = self.parent_folder(parent)?;
            if self.catalog.lookup(&key.encode())?.is_some() {
                return Err(HfsError::Exists);
            }
            let cnid = self.next_cnid()?;
            let now = crate::hfs_now();
            let thread = ThreadRecord {
                parent_id: parent,
                name: uname,
            };
            let (record, thread) = if folder {
                (
                    CatalogRecord::Folder(FolderRecord::new(cnid, now)),
                    CatalogRecord::FolderThread(thread),
                )
            } else {
                (
                    CatalogRecord::File(FileRecord::new(cnid, now)),
                    CatalogRecord::FileThread(thread),
                )
            };
            let thread_key = CatalogKey::thread(cnid);
            self.insert_record(txn, &key, &record)?;
            if let Err(err) = self.insert_record(txn, &thread_key, &thread) {
                self.undo_inserts(txn, &[&key]);
                return Err(err);
            }

            parent_rec.valence = parent_rec.valence.saturating_add(1);
            if folder {
                parent_rec.folder_count = parent_rec.folder_count.saturating_add(1);
            }
            parent_rec.dates.content_mod = now;
            if let Err(err) =
                self.replace_record(txn, &parent_key, &CatalogRecord::Folder(parent_rec))
            {
                self.undo_inserts(txn, &[&thread_key, &key]);
                return Err(err);
            }

            self.apply_volume_op(if folder { VolumeOp::MkDir } else { VolumeOp::MkFile });
            debug!(target: "hfs::volume", parent = parent.0, cnid = cnid.0, folder, "catalog_create");
            Ok(cnid)
        })
    }

    /// Next free CNID. After the counter wraps the volume is flagged
    /// `CNIDS_REUSED` and IDs still in use are skipped.
    fn next_cnid(&self) -> Result<Cnid> {
        let header = self.state.header();
        let attempts = u64::from(header.file_count) + u64::from(header.folder_count) + 1;
        for _ in 0..attempts {
            let (cnid, reused, wrapped) = self.state.update_header(|h| {
                if h.next_catalog_id < Cnid::FIRST_USER.0 {
                    h.next_catalog_id = Cnid::FIRST_USER.0;
                }
                let id = h.next_catalog_id;
                let wrapped = match id.checked_add(1) {
                    Some(next) => {
                        h.next_catalog_id = next;
                        false
                    }
                    None => {
                        h.next_catalog_id = Cnid::FIRST_USER.0;
                        h.attributes.insert(VolumeAttributes::CNIDS_REUSED);
                        true
                    }
                };
                (
                    Cnid(id),
                    h.attributes.contains(VolumeAttributes::CNIDS_REUSED),
                    wrapped,
                )
            });
            if wrapped {
                info!(target: "hfs::volume", "catalog_cnid_wrapped");
            }
            if !reused || self.thread_of(cnid)?.is_none() {
                return Ok(cnid);
            }
        }
        Err(HfsError::NoSpace)
    }

    fn parent_folder(&self, parent: Cnid) -> Result<(CatalogKey, FolderRecord)> {
        let thread = self
            .thread_of(parent)?
            .ok_or_else(|| not_found(format_args!("folder {}", parent.0)))?;
        let key = CatalogKey::new(thread.parent_id, thread.name);
        match self.lookup_key(&key)? {
            Some(CatalogRecord::Folder(folder)) if folder.folder_id == parent => Ok((key, folder)),
            Some(CatalogRecord::File(_)) => Err(HfsError::InvalidArgument(format!(
                "CNID {} is not a folder",
                parent.0
            ))),
            _ => Err(not_found(format_args!("folder {}", parent.0))),
        }
    }

    /// Take back records inserted earlier in a create that then failed.
    /// The transaction still commits, so a failed delete leaves the catalog
    /// out of step with the header and the volume is marked inconsistent.
    fn undo_inserts(&self, txn: &mut Transaction<'_>, keys: &[&CatalogKey]) {
        for key in keys {
            if let Err(err) = self.catalog.delete(txn, &key.encode()) {
                warn!(target: "hfs::volume", parent = key.parent_id.0, %err, "catalog_undo_failed");
                let _ = self
                    .state
                    .mark_inconsistent(InconsistentReason::OperationIncomplete);
                return;
            }
        }
        debug!(target: "hfs::volume", records = keys.len(), "catalog_create_undone");
    }

    fn insert_record(
        &self,
        txn: &mut Transaction<'_>,
        key: &CatalogKey,
        record: &CatalogRecord,
    ) -> Result<()> {
        let data = record.encode().map_err(parse_error)?;
        Ok(self.catalog.insert(txn, &key.encode(), &data)?)
    }

    fn replace_record(
        &self,
        txn: &mut Transaction<'_>,
        key: &CatalogKey,
        record: &CatalogRecord,
    ) -> Result<()> {
        let data = record.encode().map_err(parse_error)?;
        Ok(self.catalog.replace(txn, &key.encode(), &data)?)
    }

    // ── Delete ──────────────────────────────────────────────────────────

    /// Remove `name` from `parent`. A folder must be empty; a file's forks
    /// are released, overflow extents included.
    pub fn remove(&self, parent: Cnid, name: &str) -> Result<()> {
        let key = CatalogKey::new(parent, catalog_name(name)?);
        self.write_transaction(|txn| {
            let record = self
                .lookup_key(&key)?
                .ok_or_else(|| not_found(format_args!("{name} in folder {}", parent.0)))?;
            let (cnid, folder) = match &record {
                CatalogRecord::Folder(f) if f.valence > 0 => return Err(HfsError::NotEmpty),
                CatalogRecord::Folder(f) => (f.folder_id, true),
                CatalogRecord::File(f) => (f.file_id, false),
                _ => {
                    return Err(HfsError::Corruption {
                        block: 0,
                        detail: format!("thread record stored under a named key in {}", parent.0),
                    });
                }
            };
            if cnid == Cnid::ROOT_FOLDER {
                return Err(HfsError::InvalidArgument("cannot remove the root folder".to_owned()));
            }
            let parent_entry = self.parent_folder(parent)?;

            // Nothing has changed yet. Past this point freed blocks and
            // deleted records cannot be taken back.
            if let Err(err) = self.remove_entry(txn, &key, &record, cnid, parent_entry) {
                warn!(target: "hfs::volume", parent = parent.0, cnid = cnid.0, %err, "catalog_remove_incomplete");
                let _ = self
                    .state
                    .mark_inconsistent(InconsistentReason::OperationIncomplete);
                return Err(err);
            }

            self.apply_volume_op(if folder { VolumeOp::RmDir } else { VolumeOp::RmFile });
            debug!(target: "hfs::volume", parent = parent.0, cnid = cnid.0, folder, "catalog_remove");
            Ok(())
        })
    }

    fn remove_entry(
        &self,
        txn: &mut Transaction<'_>,
        key: &CatalogKey,
        record: &CatalogRecord,
        cnid: Cnid,
        (parent_key, mut parent_rec): (CatalogKey, FolderRecord),
    ) -> Result<()> {
        if let CatalogRecord::File(f) = record {
            self.release_fork(txn, f.file_id, ForkKind::Data, &f.data_fork)?;
            self.release_fork(txn, f.file_id, ForkKind::Resource, &f.resource_fork)?;
        }
        self.catalog.delete(txn, &key.encode())?;
        self.catalog.delete(txn, &CatalogKey::thread(cnid).encode())?;

        parent_rec.valence = parent_rec.valence.saturating_sub(1);
        if matches!(record, CatalogRecord::Folder(_)) {
            parent_rec.folder_count = parent_rec.folder_count.saturating_sub(1);
        }
        parent_rec.dates.content_mod = crate::hfs_now();
        self.replace_record(txn, &parent_key, &CatalogRecord::Folder(parent_rec))
    }

    fn release_fork(
        &self,
        txn: &mut Transaction<'_>,
        cnid: Cnid,
        kind: ForkKind,
        fork: &ForkData,
    ) -> Result<()> {
        for extent in fork.extents.iter().copied().filter(|e| !e.is_empty()) {
            self.allocator.free(txn, extent)?;
        }
        if fork.inline_blocks() >= u64::from(fork.total_blocks) {
            return Ok(());
        }
        for (key, record) in overflow_records(&self.extents, cnid, kind)? {
            for extent in record.0.into_iter().filter(|e| !e.is_empty()) {
                self.allocator.free(txn, extent)?;
            }
            self.extents.delete(txn, &key.encode())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_is_invalid_argument() {
        assert!(matches!(catalog_name(""), Err(HfsError::InvalidArgument(_))));
    }

    #[test]
    fn overlong_name_is_name_too_long() {
        let long = "x".repeat(256);
        assert!(matches!(catalog_name(&long), Err(HfsError::NameTooLong)));
        assert!(catalog_name(&"x".repeat(255)).is_ok());
    }
}
