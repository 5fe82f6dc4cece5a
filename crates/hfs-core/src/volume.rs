//! A mounted volume and its lifecycle.
//!
//! Mount order: locate and validate the header, open or replay the
//! journal, re-read the header if replay rewrote it, build the allocator,
//! open the extents, catalog and attributes trees, then clear the
//! unmounted bit on a writable mount and start the background bitmap scan.
//!
//! Write operations run through [`Volume::write_transaction`]: the writer
//! gate admits them only while the volume is mounted read-write and not
//! frozen, one journal transaction carries the operation's blocks and the
//! header, and failures are classified on the way out (corruption marks
//! the volume inconsistent, an invariant violation forces read-only).

use crate::config::MountOptions;
use crate::forks::{ForkKind, resolve_fork};
use crate::header::{self, FlushOptions, LocatedHeader};
use crate::parse_error;
use crate::state::{FreeSpaceThresholds, InconsistentReason, MountPhase, VolumeOp, VolumeState};
use asupersync::Cx;
use hfs_alloc::{AllocGeometry, AllocRequest, Allocator, ScanHandle, ScanReport};
use hfs_block::{BufferCache, ByteDevice};
use hfs_btree::{BTree, ExtentKeys, TreeCheck, compare, default_attribute_node_count};
use hfs_error::{HfsError, Result};
use hfs_journal::{Journal, ReplayReport, Transaction};
use hfs_ondisk::btree::{KEY_COMPARE_BINARY, KEY_COMPARE_CASE_FOLD};
use hfs_ondisk::{
    ExtentDescriptor, ExtentMap, HeaderLocations, JOURNAL_INFO_BLOCK_SIZE, JournalInfoBlock,
    JournalInfoFlags, VolumeAttributes, VolumeHeader,
};
use hfs_types::{ByteOffset, Cnid, FileId, LAST_MOUNTED_JOURNALED, SECTOR_SIZE};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Longest file name, in UTF-16 units.
pub const NAME_MAX: u32 = 255;

/// CNIDs available to user files and folders.
const MAX_FILES: u64 = (u32::MAX - Cnid::FIRST_USER.0) as u64;

/// `statfs` subtype bit for a journaled volume.
pub const SUBTYPE_JOURNALED: u32 = 1;
/// `statfs` subtype bit for HFSX with binary name order.
pub const SUBTYPE_CASE_SENSITIVE: u32 = 2;

// ── Public types ───────────────────────────────────────────────────────────

/// Where the journal ring lives, in device bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalLocation {
    /// Allocation block of the journal info block.
    pub info_block: u32,
    pub base: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    /// Free blocks less the reserve kept back from ordinary allocation.
    pub available_blocks: u64,
    pub files: u64,
    pub free_files: u64,
    pub name_max: u32,
    /// [`SUBTYPE_JOURNALED`] | [`SUBTYPE_CASE_SENSITIVE`].
    pub subtype: u32,
}

/// Result of [`Volume::open`].
#[derive(Debug)]
pub enum MountOutcome {
    Mounted(Box<Volume>),
    /// `journal_replay_only` was set: the journal was replayed and the
    /// volume left unmounted.
    Replayed(ReplayReport),
}

/// Everything mount learns before the trees are opened.
struct Prepared {
    located: LocatedHeader,
    header: VolumeHeader,
    locations: HeaderLocations,
    read_only: bool,
    cache: BufferCache,
    journal: Option<Journal>,
    journal_location: Option<JournalLocation>,
    replay: ReplayReport,
    /// Writable mount with the journal disabled on a journaled volume.
    drop_journaled: bool,
}

// ── Volume ─────────────────────────────────────────────────────────────────

/// A mounted HFS+ volume.
pub struct Volume {
    pub(crate) device: Arc<dyn ByteDevice>,
    pub(crate) cache: BufferCache,
    pub(crate) options: MountOptions,
    pub(crate) locations: HeaderLocations,
    pub(crate) block_size: u32,
    pub(crate) state: VolumeState,
    pub(crate) journal: RwLock<Arc<Journal>>,
    pub(crate) journal_location: Option<JournalLocation>,
    pub(crate) allocator: Allocator,
    pub(crate) extents: BTree,
    pub(crate) catalog: BTree,
    pub(crate) attributes: RwLock<Option<Arc<BTree>>>,
    pub(crate) thresholds: FreeSpaceThresholds,
    pub(crate) replay: ReplayReport,
    scan: Mutex<Option<ScanHandle>>,
    /// Held while the attributes tree is being created.
    tree_create: Mutex<()>,
    trimmed_bytes: Arc<AtomicU64>,
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("phase", &self.state.phase())
            .field("block_size", &self.block_size)
            .field("locations", &self.locations)
            .field("journal_location", &self.journal_location)
            .finish_non_exhaustive()
    }
}

impl Volume {
    // ── Mount ───────────────────────────────────────────────────────────

    /// Mount `device`, or only replay its journal when
    /// `options.journal_replay_only` is set.
    pub fn open(device: Arc<dyn ByteDevice>, options: MountOptions) -> Result<MountOutcome> {
        let prepared = Self::prepare(&device, &options)?;
        if options.journal_replay_only {
            if let Some(journal) = &prepared.journal {
                journal.close()?;
            }
            prepared.cache.flush_dirty()?;
            device.sync()?;
            info!(
                target: "hfs::volume",
                transactions = prepared.replay.transactions,
                blocks = prepared.replay.blocks,
                "volume_replay_only"
            );
            return Ok(MountOutcome::Replayed(prepared.replay));
        }
        Ok(MountOutcome::Mounted(Box::new(Self::finish(
            device, options, prepared,
        )?)))
    }

    /// Mount `device`. `journal_replay_only` is ignored; use [`Self::open`]
    /// for that.
    pub fn mount(device: Arc<dyn ByteDevice>, mut options: MountOptions) -> Result<Self> {
        options.journal_replay_only = false;
        let prepared = Self::prepare(&device, &options)?;
        Self::finish(device, options, prepared)
    }

    /// Header discovery and journal open/replay.
    fn prepare(device: &Arc<dyn ByteDevice>, options: &MountOptions) -> Result<Prepared> {
        let located = header::locate(device.as_ref())?;
        let mut header = located.header.clone();
        let read_only = options.read_only || !device.is_writable();

        if !read_only && header.is_inconsistent() && !options.allow_inconsistent_rw {
            warn!(target: "hfs::volume", "volume_mount_refused_inconsistent");
            return Err(HfsError::Inconsistent);
        }
        let locations = HeaderLocations::compute(
            located.embedded_offset,
            header.block_size,
            header.total_blocks,
            located.volume_end,
        )
        .map_err(parse_error)?;
        let cache = BufferCache::new(Arc::clone(device), options.cache);

        let mut prepared = Prepared {
            located,
            header: header.clone(),
            locations,
            read_only,
            cache,
            journal: None,
            journal_location: None,
            replay: ReplayReport::default(),
            drop_journaled: false,
        };
        if !header.is_journaled() || header.journal_info_block == 0 {
            return Ok(prepared);
        }
        if options.journal_disable {
            info!(target: "hfs::volume", read_only, "volume_journal_disabled");
            prepared.drop_journaled = !read_only;
            return Ok(prepared);
        }

        let (jib, location) = read_journal_info(device.as_ref(), &header, locations.embedded_offset)?;
        if jib.flags.contains(JournalInfoFlags::ON_OTHER_DEVICE)
            && !jib.flags.contains(JournalInfoFlags::IN_FS)
        {
            error!(target: "hfs::volume", flags = jib.flags.0, "volume_external_journal");
            return Err(HfsError::UnsupportedFeature(
                "journal on another device".to_owned(),
            ));
        }

        let stale = header.last_mounted_version != LAST_MOUNTED_JOURNALED;
        if jib.flags.contains(JournalInfoFlags::NEED_INIT) || stale {
            if !device.is_writable() || read_only {
                // Nothing trustworthy to replay; stay unjournaled until an
                // upgrade can format the ring.
                warn!(target: "hfs::volume", need_init = !stale, "volume_journal_uninitialized");
                prepared.journal_location = Some(location);
                return Ok(prepared);
            }
            let journal = Journal::create(
                prepared.cache.clone(),
                ByteOffset(location.base),
                location.size,
                options.journal,
            )?;
            if jib.flags.contains(JournalInfoFlags::NEED_INIT) {
                let cleared = JournalInfoBlock {
                    flags: JournalInfoFlags(jib.flags.0 & !JournalInfoFlags::NEED_INIT.0),
                    ..jib
                };
                write_journal_info(device.as_ref(), &location, &cleared, locations.embedded_offset, header.block_size)?;
            }
            info!(target: "hfs::volume", base = location.base, size = location.size, stale, "volume_journal_initialized");
            prepared.journal = Some(journal);
            prepared.journal_location = Some(location);
            return Ok(prepared);
        }

        if !device.is_writable() {
            warn!(target: "hfs::volume", "volume_journal_replay_skipped");
            prepared.journal_location = Some(location);
            return Ok(prepared);
        }
        let opened = Journal::open(
            prepared.cache.clone(),
            ByteOffset(location.base),
            location.size,
            options.journal,
        );
        let (journal, report) = match opened {
            Ok(pair) => pair,
            Err(err) => {
                error!(target: "hfs::volume", %err, "volume_journal_open_failed");
                if !read_only {
                    header::write_fsck_marker(device.as_ref(), locations.primary)?;
                }
                return Err(err.into());
            }
        };
        if report.transactions > 0 {
            header = header::read_validated(
                device.as_ref(),
                locations.primary,
                Some(header.block_size),
            )?;
            prepared.header = header;
            info!(
                target: "hfs::volume",
                transactions = report.transactions,
                blocks = report.blocks,
                "volume_journal_replayed"
            );
        }
        prepared.journal = Some(journal);
        prepared.journal_location = Some(location);
        prepared.replay = report;
        Ok(prepared)
    }

    /// Allocator, trees, and the writable-mount header update.
    fn finish(
        device: Arc<dyn ByteDevice>,
        options: MountOptions,
        prepared: Prepared,
    ) -> Result<Self> {
        let Prepared {
            located,
            header,
            locations,
            read_only,
            cache,
            journal,
            journal_location,
            replay,
            drop_journaled,
        } = prepared;
        let block_size = header.block_size;
        let base = locations.embedded_offset;

        let logged = journal.is_some();
        let journal =
            Arc::new(journal.unwrap_or_else(|| Journal::direct(cache.clone(), options.journal)));
        let trimmed_bytes = Arc::new(AtomicU64::new(0));
        install_trim_callback(&journal, &device, &trimmed_bytes);

        let extents_map = ExtentMap::from_fork(block_size, base, &header.extents_file);
        let bitmap = if header.allocation_file.inline_blocks()
            < u64::from(header.allocation_file.total_blocks)
        {
            let overflow = BTree::open(
                cache.clone(),
                FileId::EXTENTS,
                extents_map.clone(),
                Arc::new(ExtentKeys),
                None,
            )?;
            resolve_fork(
                Some(&overflow),
                Cnid::ALLOCATION_FILE,
                ForkKind::Data,
                &header.allocation_file,
                block_size,
                base,
            )?
        } else {
            ExtentMap::from_fork(block_size, base, &header.allocation_file)
        };
        let allocator = Allocator::new(
            cache.clone(),
            AllocGeometry {
                total_blocks: header.total_blocks,
                block_size,
                volume_offset: base,
                bitmap,
            },
            options.allocator,
            header.free_blocks,
            header.next_allocation,
        )?;

        let extents = BTree::open(
            cache.clone(),
            FileId::EXTENTS,
            extents_map,
            Arc::new(ExtentKeys),
            Some(allocator.clone()),
        )?;
        let catalog = open_catalog(&cache, &extents, &allocator, &header, base)?;
        let attributes = if header.attributes_file.total_blocks > 0 {
            let map = resolve_fork(
                Some(&extents),
                Cnid::ATTRIBUTES_FILE,
                ForkKind::Data,
                &header.attributes_file,
                block_size,
                base,
            )?;
            Some(Arc::new(BTree::open(
                cache.clone(),
                FileId::ATTRIBUTES,
                map,
                compare::for_file(FileId::ATTRIBUTES, KEY_COMPARE_BINARY),
                Some(allocator.clone()),
            )?))
        } else {
            None
        };

        let thresholds = FreeSpaceThresholds::for_volume(header.total_blocks, block_size);
        let volume = Self {
            device,
            cache,
            options,
            locations,
            block_size,
            state: VolumeState::new(header, read_only),
            journal: RwLock::new(journal),
            journal_location,
            allocator,
            extents,
            catalog,
            attributes: RwLock::new(attributes),
            thresholds,
            replay,
            scan: Mutex::new(None),
            tree_create: Mutex::new(()),
            trimmed_bytes,
        };

        if located.used_alternate {
            let _ = volume
                .state
                .mark_inconsistent(InconsistentReason::DetectedCorruption);
        }
        if !read_only {
            volume.state.update_header_with_alternate(|h| {
                h.attributes.remove(VolumeAttributes::UNMOUNTED);
                if drop_journaled {
                    h.attributes.remove(VolumeAttributes::JOURNALED);
                }
                h.write_count = h.write_count.wrapping_add(1);
            });
            volume.commit_header(FlushOptions::WAIT.with_alternate())?;
            if options.run_mount_scan {
                *volume.scan.lock() = Some(volume.allocator.start_scan(Cx::for_request())?);
            }
        }
        volume.state.set_mounted(read_only);
        let _ = volume
            .state
            .note_free_level(thresholds.level(volume.allocator.free_blocks()));
        info!(
            target: "hfs::volume",
            read_only,
            journaled = logged,
            block_size,
            total_blocks = volume.state.header().total_blocks,
            embedded_offset = base,
            replayed = replay.transactions,
            "volume_mounted"
        );
        Ok(volume)
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn header(&self) -> VolumeHeader {
        self.state.header()
    }

    #[must_use]
    pub fn phase(&self) -> MountPhase {
        self.state.phase()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.state.is_read_only()
    }

    #[must_use]
    pub fn state(&self) -> &VolumeState {
        &self.state
    }

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    #[must_use]
    pub fn locations(&self) -> HeaderLocations {
        self.locations
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn ByteDevice> {
        &self.device
    }

    #[must_use]
    pub fn cache(&self) -> &BufferCache {
        &self.cache
    }

    /// The journal currently in use; replaced on upgrade.
    #[must_use]
    pub fn journal(&self) -> Arc<Journal> {
        Arc::clone(&self.journal.read())
    }

    #[must_use]
    pub fn journal_location(&self) -> Option<JournalLocation> {
        self.journal_location
    }

    /// What replay did at mount.
    #[must_use]
    pub fn replay_report(&self) -> ReplayReport {
        self.replay
    }

    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    #[must_use]
    pub fn extents_tree(&self) -> &BTree {
        &self.extents
    }

    #[must_use]
    pub fn catalog_tree(&self) -> &BTree {
        &self.catalog
    }

    #[must_use]
    pub fn attributes_tree(&self) -> Option<Arc<BTree>> {
        self.attributes.read().clone()
    }

    #[must_use]
    pub fn thresholds(&self) -> FreeSpaceThresholds {
        self.thresholds
    }

    /// Bytes handed to the device as trims after their freeing
    /// transactions committed.
    #[must_use]
    pub fn trimmed_bytes(&self) -> u64 {
        self.trimmed_bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_case_sensitive(&self) -> bool {
        self.catalog.comparator().compare_type() == KEY_COMPARE_BINARY
    }

    // ── Transactions ────────────────────────────────────────────────────

    /// Run `f` as one write operation inside one journal transaction.
    ///
    /// The header is flushed into the same transaction on a journaled
    /// volume. Special-file forks changed by `f` are copied into the header
    /// and schedule an alternate-header write.
    ///
    /// The transaction commits even when `f` fails: blocks it already
    /// changed stay changed. An `f` that fails after its first write must
    /// take that write back itself or mark the volume inconsistent.
    pub fn write_transaction<T>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let _writer = self.state.enter_writer()?;
        self.run_transaction("write_transaction", f)
    }

    pub(crate) fn run_transaction<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let journal = self.journal();
        let mut txn = journal.begin().map_err(|err| self.classify(op, err.into()))?;
        let outcome = f(&mut txn).and_then(|value| {
            self.collect_fork_changes();
            if journal.is_logged() {
                let _ = self.flush_header(&mut txn, FlushOptions::IF_DIRTY)?;
            }
            Ok(value)
        });
        let committed = txn.commit().map_err(HfsError::from);
        match (outcome, committed) {
            (Ok(value), Ok(_)) => {
                self.check_free_space();
                Ok(value)
            }
            (Ok(_), Err(err)) => Err(self.classify(op, err)),
            (Err(err), Ok(_)) => Err(self.classify(op, err)),
            (Err(err), Err(commit_err)) => {
                warn!(target: "hfs::volume", op, %commit_err, "volume_transaction_abandoned");
                let _ = self
                    .state
                    .mark_inconsistent(InconsistentReason::OperationIncomplete);
                let _ = self.classify(op, commit_err);
                Err(self.classify(op, err))
            }
        }
    }

    /// Flush the header in a transaction of its own, outside the writer
    /// gate.
    pub(crate) fn commit_header(&self, opts: FlushOptions) -> Result<bool> {
        self.run_transaction("flush_header", |txn| self.flush_header(txn, opts))
    }

    /// React to an operation error by its class and hand it back.
    fn classify(&self, op: &'static str, err: HfsError) -> HfsError {
        if err.is_corruption() {
            let _ = self
                .state
                .mark_inconsistent(InconsistentReason::DetectedCorruption);
        }
        if err.is_invariant_violation() {
            self.state.force_read_only(&err.to_string());
        }
        debug!(target: "hfs::volume", op, %err, "volume_operation_failed");
        err
    }

    fn collect_fork_changes(&self) {
        let attributes = self.attributes_tree();
        let trees = [Some(&self.extents), Some(&self.catalog), attributes.as_deref()];
        for tree in trees.into_iter().flatten() {
            if !tree.take_fork_changed() {
                continue;
            }
            let fork = tree.fork_data();
            let file = tree.file();
            debug!(target: "hfs::volume", file = %file, total_blocks = fork.total_blocks, "volume_special_fork_changed");
            self.state.update_header_with_alternate(|h| match file {
                FileId::EXTENTS => h.extents_file = fork,
                FileId::CATALOG => h.catalog_file = fork,
                FileId::ATTRIBUTES => h.attributes_file = fork,
                _ => {}
            });
        }
    }

    fn check_free_space(&self) {
        let free = self.allocator.free_blocks();
        let level = self.thresholds.level(free);
        if let Some(old) = self.state.note_free_level(level) {
            if level < old {
                warn!(target: "hfs::volume", free_blocks = free, ?level, "volume_free_space_low");
            } else {
                info!(target: "hfs::volume", free_blocks = free, ?level, "volume_free_space_recovered");
            }
        }
    }

    // ── Space ───────────────────────────────────────────────────────────

    /// Allocate blocks in a transaction of their own.
    pub fn allocate(&self, request: AllocRequest) -> Result<ExtentDescriptor> {
        self.write_transaction(|txn| Ok(self.allocator.allocate(txn, request)?))
    }

    pub fn free(&self, extent: ExtentDescriptor) -> Result<()> {
        self.write_transaction(|txn| Ok(self.allocator.free(txn, extent)?))
    }

    /// Wait for the mount-time bitmap scan, if one is running.
    pub fn wait_for_scan(&self) -> Result<Option<ScanReport>> {
        let Some(handle) = self.scan.lock().take() else {
            return Ok(None);
        };
        let report = handle.join()?;
        if report.corrected_free_count {
            self.state.update_header(|_| ());
        }
        Ok(Some(report))
    }

    /// Create the attributes tree if the volume has none.
    ///
    /// Sized by [`default_attribute_node_count`] from the catalog and free
    /// space. A concurrent creation reports [`HfsError::Busy`].
    pub fn create_attributes_tree(&self, node_size: u16) -> Result<Arc<BTree>> {
        let _writer = self.state.enter_writer()?;
        let Some(_creating) = self.tree_create.try_lock() else {
            return Err(HfsError::Busy);
        };
        if let Some(tree) = self.attributes_tree() {
            return Ok(tree);
        }
        let catalog_fork = self.catalog.fork_data();
        let free_bytes =
            u64::from(self.allocator.free_blocks()) * u64::from(self.block_size);
        let nodes = default_attribute_node_count(
            catalog_fork.logical_size,
            catalog_fork.clump_size,
            free_bytes,
            node_size,
        );
        let tree = self.run_transaction("create_attributes_tree", |txn| {
            let tree = BTree::create_attributes(
                txn,
                self.cache.clone(),
                self.allocator.clone(),
                node_size,
                nodes,
            )?;
            let _ = tree.take_fork_changed();
            let fork = tree.fork_data();
            self.state
                .update_header_with_alternate(|h| h.attributes_file = fork);
            Ok(Arc::new(tree))
        })?;
        *self.attributes.write() = Some(Arc::clone(&tree));
        Ok(tree)
    }

    // ── Header maintenance ──────────────────────────────────────────────

    /// Flag the volume for a consistency check.
    pub fn mark_inconsistent(&self, reason: InconsistentReason) {
        let _ = self.state.mark_inconsistent(reason);
    }

    /// Apply a counter change and stamp the modification date.
    pub fn volume_update(&self, op: VolumeOp) -> Result<()> {
        self.write_transaction(|_| {
            self.apply_volume_op(op);
            Ok(())
        })
    }

    pub(crate) fn apply_volume_op(&self, op: VolumeOp) {
        let now = crate::hfs_now();
        self.state.update_header(|h| {
            match op {
                VolumeOp::Update => {}
                VolumeOp::MkDir => h.folder_count = h.folder_count.saturating_add(1),
                VolumeOp::RmDir => h.folder_count = h.folder_count.saturating_sub(1),
                VolumeOp::MkFile => h.file_count = h.file_count.saturating_add(1),
                VolumeOp::RmFile => h.file_count = h.file_count.saturating_sub(1),
            }
            h.modify_date = now;
        });
    }

    /// Record that a name in text `encoding` was used on the volume.
    pub fn set_encoding_bit(&self, encoding: u32) -> Result<()> {
        let Some(bit) = encoding_bit(encoding) else {
            return Ok(());
        };
        if self.state.header().encodings_bitmap & (1 << bit) != 0 {
            return Ok(());
        }
        self.write_transaction(|_| {
            self.state.update_header(|h| h.encodings_bitmap |= 1 << bit);
            Ok(())
        })
    }

    // ── Queries ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn statfs(&self) -> StatFs {
        let header = self.state.header();
        let free = u64::from(self.allocator.free_blocks());
        let reserve = u64::from(self.thresholds.danger);
        let available = free.saturating_sub(reserve);
        let used_cnids = u64::from(header.file_count) + u64::from(header.folder_count);
        let free_cnids = MAX_FILES.saturating_sub(used_cnids);
        let mut subtype = 0;
        if self.journal().is_logged() {
            subtype |= SUBTYPE_JOURNALED;
        }
        if self.is_case_sensitive() {
            subtype |= SUBTYPE_CASE_SENSITIVE;
        }
        StatFs {
            block_size: self.block_size,
            total_blocks: u64::from(header.total_blocks),
            free_blocks: free,
            available_blocks: available,
            files: u64::from(header.total_blocks).saturating_sub(2),
            free_files: free_cnids.min(available),
            name_max: NAME_MAX,
            subtype,
        }
    }

    /// Structural check of the catalog and extents trees.
    pub fn check_trees(&self) -> Result<Vec<TreeCheck>> {
        let mut checks = vec![self.extents.check()?, self.catalog.check()?];
        if let Some(attributes) = self.attributes_tree() {
            checks.push(attributes.check()?);
        }
        Ok(checks)
    }

    // ── Sync / freeze ───────────────────────────────────────────────────

    /// Make every committed change durable at its home location.
    ///
    /// Returns without doing anything while a freeze or mode change is in
    /// progress.
    pub fn sync(&self) -> Result<()> {
        let syncer = match self.state.begin_sync() {
            Err(HfsError::ReadOnly) => return Ok(()),
            other => other?,
        };
        let Some(_syncer) = syncer else {
            debug!(target: "hfs::volume", "volume_sync_deferred");
            return Ok(());
        };
        self.flush_all(FlushOptions::IF_DIRTY)
    }

    fn flush_all(&self, opts: FlushOptions) -> Result<()> {
        let journal = self.journal();
        if !self.state.is_read_only() {
            let _ = self.commit_header(opts)?;
        }
        journal.flush()?;
        let _ = self.cache.flush_dirty()?;
        self.device.sync()
    }

    /// Block new write transactions, wait for in-flight ones and syncers,
    /// then flush the journal.
    ///
    /// If `cx` is cancelled or its budget runs out while waiting, the
    /// volume returns to `Mounted` with [`HfsError::Interrupted`].
    pub fn freeze(&self, cx: &Cx) -> Result<()> {
        self.state.begin_freeze(cx)?;
        if let Err(err) = self.flush_all(FlushOptions::IF_DIRTY) {
            self.state.abort_freeze();
            return Err(err);
        }
        self.state.finish_freeze();
        Ok(())
    }

    pub fn thaw(&self) -> Result<()> {
        if !self.state.begin_thaw() {
            return Err(HfsError::InvalidArgument("volume is not frozen".to_owned()));
        }
        self.state.finish_thaw();
        Ok(())
    }

    // ── Mode changes ────────────────────────────────────────────────────

    /// Switch a read-write mount to read-only.
    ///
    /// Order: flush, set the unmounted bit, flush the header, close the
    /// journal, then sync the device.
    pub fn downgrade(&self) -> Result<()> {
        if self.state.is_read_only() {
            return Ok(());
        }
        self.state.begin_mode_change()?;
        let result = self.downgrade_locked();
        self.state.end_mode_change(result.is_ok());
        if result.is_ok() {
            info!(target: "hfs::volume", "volume_downgraded");
        }
        result
    }

    fn downgrade_locked(&self) -> Result<()> {
        let _ = self.wait_for_scan()?;
        let journal = self.journal();
        journal.flush()?;
        let _ = self.cache.flush_dirty()?;
        self.state.update_header(|h| {
            if !h.is_inconsistent() {
                h.attributes.insert(VolumeAttributes::UNMOUNTED);
            }
        });
        let _ = self.commit_header(FlushOptions::WAIT)?;
        journal.close()?;
        debug!(target: "hfs::volume", "volume_journal_closed");
        if let Err(err) = self.device.sync() {
            error!(target: "hfs::volume", %err, "volume_downgrade_sync_failed");
            self.state
                .update_header(|h| h.attributes.remove(VolumeAttributes::UNMOUNTED));
            self.reopen_journal()?;
            return Err(err);
        }
        Ok(())
    }

    /// Switch a read-only mount to read-write.
    pub fn upgrade(&self) -> Result<()> {
        if !self.state.is_read_only() {
            return Ok(());
        }
        if !self.device.is_writable() {
            return Err(HfsError::ReadOnly);
        }
        if self.state.header().is_inconsistent() && !self.options.allow_inconsistent_rw {
            warn!(target: "hfs::volume", "volume_upgrade_refused_inconsistent");
            return Err(HfsError::Inconsistent);
        }
        self.state.begin_mode_change()?;
        let result = self.upgrade_locked();
        self.state.end_mode_change(result.is_err());
        if result.is_ok() {
            info!(target: "hfs::volume", "volume_upgraded");
        }
        result
    }

    fn upgrade_locked(&self) -> Result<()> {
        let journal = self.journal();
        if journal.is_closed() || (self.journal_location.is_some() && !journal.is_logged()) {
            self.reopen_journal()?;
        }
        self.state.update_header_with_alternate(|h| {
            h.attributes.remove(VolumeAttributes::UNMOUNTED);
            h.write_count = h.write_count.wrapping_add(1);
        });
        let _ = self.commit_header(FlushOptions::WAIT.with_alternate())?;
        Ok(())
    }

    /// Replace the journal with a fresh handle on the same ring, or a
    /// direct journal when the volume has none.
    fn reopen_journal(&self) -> Result<()> {
        let journal = match self.journal_location {
            Some(loc) if !self.options.journal_disable => {
                let fresh = self.state.header().last_mounted_version != LAST_MOUNTED_JOURNALED;
                if fresh {
                    Journal::create(
                        self.cache.clone(),
                        ByteOffset(loc.base),
                        loc.size,
                        self.options.journal,
                    )?
                } else {
                    let (journal, report) = Journal::open(
                        self.cache.clone(),
                        ByteOffset(loc.base),
                        loc.size,
                        self.options.journal,
                    )?;
                    debug!(target: "hfs::volume", replayed = report.transactions, "volume_journal_reopened");
                    journal
                }
            }
            _ => Journal::direct(self.cache.clone(), self.options.journal),
        };
        let journal = Arc::new(journal);
        install_trim_callback(&journal, &self.device, &self.trimmed_bytes);
        *self.journal.write() = journal;
        Ok(())
    }

    // ── Unmount ─────────────────────────────────────────────────────────

    /// Flush everything, set the clean-unmount bit and close the journal.
    ///
    /// A failed header flush clears the bit again so the next mount sees
    /// an unclean volume.
    pub fn unmount(&self) -> Result<()> {
        self.state.begin_unmount()?;
        let result = self.unmount_locked();
        self.state.finish_unmount();
        match &result {
            Ok(()) => info!(target: "hfs::volume", "volume_unmounted"),
            Err(err) => error!(target: "hfs::volume", %err, "volume_unmount_failed"),
        }
        result
    }

    fn unmount_locked(&self) -> Result<()> {
        let scan = self.wait_for_scan();
        let journal = self.journal();
        if !self.state.is_read_only() {
            let hint = self.allocator.unmount_hint();
            self.state.update_header(|h| {
                if !h.is_inconsistent() {
                    h.attributes.insert(VolumeAttributes::UNMOUNTED);
                }
            });
            if let Err(err) = self.commit_header(FlushOptions::WAIT) {
                self.state
                    .update_header(|h| h.attributes.remove(VolumeAttributes::UNMOUNTED));
                return Err(err);
            }
            debug!(target: "hfs::volume", next_allocation = hint, "volume_unmount_header_written");
        }
        journal.close()?;
        let _ = self.cache.flush_dirty()?;
        self.device.sync()?;
        scan.map(|_| ())
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn install_trim_callback(
    journal: &Journal,
    device: &Arc<dyn ByteDevice>,
    trimmed: &Arc<AtomicU64>,
) {
    let device = Arc::clone(device);
    let trimmed = Arc::clone(trimmed);
    journal.set_trim_callback(Box::new(move |ranges| {
        let bytes: u64 = ranges.iter().map(|&(_, len)| len).sum();
        match device.trim(ranges) {
            Ok(()) => {
                let _ = trimmed.fetch_add(bytes, Ordering::Relaxed);
            }
            Err(err) => warn!(target: "hfs::volume", %err, "volume_trim_failed"),
        }
    }));
}

fn open_catalog(
    cache: &BufferCache,
    extents: &BTree,
    allocator: &Allocator,
    header: &VolumeHeader,
    base: u64,
) -> Result<BTree> {
    let map = resolve_fork(
        Some(extents),
        Cnid::CATALOG_FILE,
        ForkKind::Data,
        &header.catalog_file,
        header.block_size,
        base,
    )?;
    let catalog = BTree::open(
        cache.clone(),
        FileId::CATALOG,
        map.clone(),
        compare::for_file(FileId::CATALOG, KEY_COMPARE_CASE_FOLD),
        Some(allocator.clone()),
    )?;
    if header.is_hfsx() && catalog.header().key_compare_type == KEY_COMPARE_BINARY {
        return Ok(BTree::open(
            cache.clone(),
            FileId::CATALOG,
            map,
            compare::for_file(FileId::CATALOG, KEY_COMPARE_BINARY),
            Some(allocator.clone()),
        )?);
    }
    Ok(catalog)
}

fn read_journal_info(
    device: &dyn ByteDevice,
    header: &VolumeHeader,
    base: u64,
) -> Result<(JournalInfoBlock, JournalLocation)> {
    let offset = base + u64::from(header.journal_info_block) * u64::from(header.block_size);
    let mut buf = [0_u8; SECTOR_SIZE as usize];
    device.read_exact_at(ByteOffset(offset), &mut buf)?;
    let jib = JournalInfoBlock::parse(&buf[..JOURNAL_INFO_BLOCK_SIZE]).map_err(parse_error)?;
    let location = JournalLocation {
        info_block: header.journal_info_block,
        base: base + jib.offset,
        size: jib.size,
    };
    debug!(
        target: "hfs::volume",
        flags = jib.flags.0,
        base = location.base,
        size = location.size,
        "volume_journal_info"
    );
    Ok((jib, location))
}

fn write_journal_info(
    device: &dyn ByteDevice,
    location: &JournalLocation,
    jib: &JournalInfoBlock,
    base: u64,
    block_size: u32,
) -> Result<()> {
    let offset = base + u64::from(location.info_block) * u64::from(block_size);
    let mut buf = [0_u8; SECTOR_SIZE as usize];
    device.read_exact_at(ByteOffset(offset), &mut buf)?;
    jib.encode_into(&mut buf).map_err(parse_error)?;
    device.write_all_at(ByteOffset(offset), &buf)?;
    device.sync()
}

/// Encodings-bitmap bit for a text encoding: the encoding itself below 64,
/// with the two high encodings HFS+ tracks folded in.
fn encoding_bit(encoding: u32) -> Option<u32> {
    match encoding {
        0..=63 => Some(encoding),
        152 => Some(48),
        140 => Some(49),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_bits_fold_high_encodings() {
        assert_eq!(encoding_bit(0), Some(0));
        assert_eq!(encoding_bit(35), Some(35));
        assert_eq!(encoding_bit(152), Some(48));
        assert_eq!(encoding_bit(140), Some(49));
        assert_eq!(encoding_bit(4000), None);
    }

    #[test]
    fn max_files_excludes_reserved_cnids() {
        assert_eq!(MAX_FILES, u64::from(u32::MAX) - 16);
    }
}
