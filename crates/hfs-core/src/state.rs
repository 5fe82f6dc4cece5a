//! Mount-session state.
//!
//! [`VolumeState`] owns every mutable flag of a mounted volume: the mount
//! phase, the read-only bit, the in-memory copy of the volume header and
//! the counts of in-flight writers and syncers that freeze, mode changes
//! and unmount wait on. All transitions are methods taking the internal
//! lock; nothing outside this module touches the fields.
//!
//! ```text
//! Unmounted → Mounting → Mounted(rw|ro) → Unmounting → Unmounted
//!                          │      ▲
//!                          ▼      │
//!                     Freezing → Frozen → Thawing
//! ```

use asupersync::Cx;
use hfs_error::{HfsError, Result};
use hfs_ondisk::{VolumeAttributes, VolumeHeader};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// How often a freezer waiting for writers re-checks its context.
const FREEZE_POLL: Duration = Duration::from_millis(10);

// ── Public types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountPhase {
    Unmounted,
    Mounting,
    Mounted { read_only: bool },
    Freezing,
    Frozen,
    Thawing,
    Unmounting,
}

/// Why the volume was flagged for a consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InconsistentReason {
    DetectedCorruption,
    RollbackFailed,
    OperationIncomplete,
    FsckRequested,
}

impl fmt::Display for InconsistentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DetectedCorruption => "detected_corruption",
            Self::RollbackFailed => "rollback_failed",
            Self::OperationIncomplete => "operation_incomplete",
            Self::FsckRequested => "fsck_requested",
        })
    }
}

/// Counter change recorded by [`crate::Volume::volume_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeOp {
    /// Only the modification date changes.
    Update,
    MkDir,
    RmDir,
    MkFile,
    RmFile,
}

// ── Free-space thresholds ──────────────────────────────────────────────────

const MIB: u64 = 1024 * 1024;

/// Free-block levels below which the volume reports low space, smallest
/// first. Each is the lesser of a fixed byte amount and a share of the
/// volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpaceThresholds {
    pub danger: u32,
    pub warning: u32,
    pub near_warning: u32,
    pub desired: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FreeSpaceLevel {
    Danger,
    Warning,
    NearWarning,
    BelowDesired,
    Ample,
}

impl FreeSpaceThresholds {
    #[must_use]
    pub fn for_volume(total_blocks: u32, block_size: u32) -> Self {
        let level = |bytes: u64, percent: u64| -> u32 {
            let by_bytes = bytes / u64::from(block_size.max(1));
            let by_share = u64::from(total_blocks) * percent / 100;
            u32::try_from(by_bytes.min(by_share)).unwrap_or(u32::MAX)
        };
        Self {
            danger: level(150 * MIB, 1),
            warning: level(500 * MIB, 2),
            near_warning: level(1024 * MIB, 10),
            desired: level(1228 * MIB, 12),
        }
    }

    #[must_use]
    pub fn level(&self, free_blocks: u32) -> FreeSpaceLevel {
        if free_blocks < self.danger {
            FreeSpaceLevel::Danger
        } else if free_blocks < self.warning {
            FreeSpaceLevel::Warning
        } else if free_blocks < self.near_warning {
            FreeSpaceLevel::NearWarning
        } else if free_blocks < self.desired {
            FreeSpaceLevel::BelowDesired
        } else {
            FreeSpaceLevel::Ample
        }
    }
}

// ── State ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct StateInner {
    phase: MountPhase,
    read_only: bool,
    mode_change: bool,
    header: VolumeHeader,
    dirty: bool,
    /// Bumped on every header change so a flush only clears `dirty` when
    /// nothing changed behind it.
    generation: u64,
    alternate_due: bool,
    writers: usize,
    syncers: usize,
    free_level: FreeSpaceLevel,
}

impl StateInner {
    fn mounted(&self) -> MountPhase {
        MountPhase::Mounted {
            read_only: self.read_only,
        }
    }

    fn quiescent(&self) -> bool {
        self.writers == 0 && self.syncers == 0
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.generation += 1;
    }
}

/// Header copy taken for a flush.
#[derive(Debug, Clone)]
pub(crate) struct HeaderSnapshot {
    pub(crate) header: VolumeHeader,
    pub(crate) generation: u64,
    pub(crate) alternate_due: bool,
}

#[derive(Debug)]
pub struct VolumeState {
    inner: Mutex<StateInner>,
    changed: Condvar,
}

impl VolumeState {
    pub(crate) fn new(header: VolumeHeader, read_only: bool) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                phase: MountPhase::Mounting,
                read_only,
                mode_change: false,
                header,
                dirty: false,
                generation: 0,
                alternate_due: false,
                writers: 0,
                syncers: 0,
                free_level: FreeSpaceLevel::Ample,
            }),
            changed: Condvar::new(),
        }
    }

    #[must_use]
    pub fn phase(&self) -> MountPhase {
        self.inner.lock().phase
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.lock().read_only
    }

    #[must_use]
    pub fn header(&self) -> VolumeHeader {
        self.inner.lock().header.clone()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    #[must_use]
    pub fn writers(&self) -> usize {
        self.inner.lock().writers
    }

    // ── Header ──────────────────────────────────────────────────────────

    /// Change the in-memory header and mark it dirty.
    pub(crate) fn update_header<R>(&self, f: impl FnOnce(&mut VolumeHeader) -> R) -> R {
        let mut st = self.inner.lock();
        let out = f(&mut st.header);
        st.touch();
        out
    }

    /// Change the header and require the alternate copies on the next
    /// flush.
    pub(crate) fn update_header_with_alternate<R>(
        &self,
        f: impl FnOnce(&mut VolumeHeader) -> R,
    ) -> R {
        let mut st = self.inner.lock();
        let out = f(&mut st.header);
        st.touch();
        st.alternate_due = true;
        out
    }

    /// Copy of the header for a flush; `None` when `if_dirty` is set and
    /// nothing changed.
    pub(crate) fn snapshot(&self, if_dirty: bool) -> Option<HeaderSnapshot> {
        let st = self.inner.lock();
        if if_dirty && !st.dirty {
            return None;
        }
        Some(HeaderSnapshot {
            header: st.header.clone(),
            generation: st.generation,
            alternate_due: st.alternate_due,
        })
    }

    /// Record a completed flush of `written`, whose allocator counters and
    /// mount marker become the in-memory values.
    pub(crate) fn flushed(&self, generation: u64, wrote_alternate: bool, written: &VolumeHeader) {
        let mut st = self.inner.lock();
        st.header.free_blocks = written.free_blocks;
        st.header.next_allocation = written.next_allocation;
        st.header.last_mounted_version = written.last_mounted_version;
        if st.generation == generation {
            st.dirty = false;
        }
        if wrote_alternate {
            st.alternate_due = false;
        }
    }

    /// Set the inconsistent attribute. Returns true when it was not set
    /// before; only that first transition is logged.
    pub(crate) fn mark_inconsistent(&self, reason: InconsistentReason) -> bool {
        let mut st = self.inner.lock();
        if st.header.attributes.contains(VolumeAttributes::INCONSISTENT) {
            return false;
        }
        st.header.attributes.insert(VolumeAttributes::INCONSISTENT);
        st.touch();
        let read_only = st.read_only;
        drop(st);
        error!(target: "hfs::volume", %reason, read_only, "volume_mark_inconsistent");
        true
    }

    // ── Phase transitions ───────────────────────────────────────────────

    pub(crate) fn set_mounted(&self, read_only: bool) {
        let mut st = self.inner.lock();
        st.read_only = read_only;
        st.phase = MountPhase::Mounted { read_only };
        drop(st);
        self.changed.notify_all();
    }

    /// Stop accepting transactions after an invariant violation.
    pub(crate) fn force_read_only(&self, detail: &str) {
        let mut st = self.inner.lock();
        if st.read_only {
            return;
        }
        st.read_only = true;
        if matches!(st.phase, MountPhase::Mounted { .. }) {
            st.phase = MountPhase::Mounted { read_only: true };
        }
        drop(st);
        self.changed.notify_all();
        error!(target: "hfs::volume", invariant = "transaction_protocol", detail, "volume_forced_read_only");
    }

    /// Admit one write operation, waiting out a freeze or mode change.
    pub(crate) fn enter_writer(&self) -> Result<WriterGuard<'_>> {
        let mut st = self.inner.lock();
        loop {
            match st.phase {
                MountPhase::Mounted { .. } if st.read_only => return Err(HfsError::ReadOnly),
                MountPhase::Mounted { .. } if !st.mode_change => break,
                MountPhase::Mounted { .. }
                | MountPhase::Freezing
                | MountPhase::Frozen
                | MountPhase::Thawing => self.changed.wait(&mut st),
                MountPhase::Unmounted | MountPhase::Mounting | MountPhase::Unmounting => {
                    return Err(HfsError::Busy);
                }
            }
        }
        st.writers += 1;
        Ok(WriterGuard { state: self })
    }

    /// Admit a syncer unless a freeze or mode change is under way.
    pub(crate) fn begin_sync(&self) -> Result<Option<SyncGuard<'_>>> {
        let mut st = self.inner.lock();
        match st.phase {
            MountPhase::Mounted { .. } if st.mode_change => Ok(None),
            MountPhase::Mounted { .. } if st.read_only => Err(HfsError::ReadOnly),
            MountPhase::Mounted { .. } => {
                st.syncers += 1;
                Ok(Some(SyncGuard { state: self }))
            }
            MountPhase::Freezing | MountPhase::Frozen | MountPhase::Thawing => Ok(None),
            MountPhase::Unmounted | MountPhase::Mounting | MountPhase::Unmounting => {
                Err(HfsError::Busy)
            }
        }
    }

    /// Enter `Freezing` and wait for writers and syncers to leave.
    ///
    /// A cancelled or expired `cx` returns the volume to `Mounted` and
    /// reports [`HfsError::Interrupted`].
    pub(crate) fn begin_freeze(&self, cx: &Cx) -> Result<()> {
        let mut st = self.inner.lock();
        match st.phase {
            MountPhase::Mounted { .. } if !st.mode_change => {}
            _ => return Err(HfsError::Busy),
        }
        st.phase = MountPhase::Freezing;
        info!(target: "hfs::volume", writers = st.writers, syncers = st.syncers, "volume_freezing");
        while !st.quiescent() {
            if cx.checkpoint().is_err() {
                st.phase = st.mounted();
                drop(st);
                self.changed.notify_all();
                info!(target: "hfs::volume", "volume_freeze_interrupted");
                return Err(HfsError::Interrupted);
            }
            let _ = self.changed.wait_for(&mut st, FREEZE_POLL);
        }
        Ok(())
    }

    pub(crate) fn finish_freeze(&self) {
        self.inner.lock().phase = MountPhase::Frozen;
        info!(target: "hfs::volume", "volume_frozen");
    }

    pub(crate) fn abort_freeze(&self) {
        let mut st = self.inner.lock();
        st.phase = st.mounted();
        drop(st);
        self.changed.notify_all();
        warn!(target: "hfs::volume", "volume_freeze_aborted");
    }

    /// Leave `Frozen` for `Thawing`; returns false when the volume was not
    /// frozen.
    pub(crate) fn begin_thaw(&self) -> bool {
        let mut st = self.inner.lock();
        if st.phase != MountPhase::Frozen {
            return false;
        }
        st.phase = MountPhase::Thawing;
        true
    }

    pub(crate) fn finish_thaw(&self) {
        let mut st = self.inner.lock();
        st.phase = st.mounted();
        drop(st);
        self.changed.notify_all();
        info!(target: "hfs::volume", "volume_thawed");
    }

    /// Block writers and wait for the volume to go quiet before a
    /// read-only/read-write switch.
    pub(crate) fn begin_mode_change(&self) -> Result<()> {
        let mut st = self.inner.lock();
        if !matches!(st.phase, MountPhase::Mounted { .. }) || st.mode_change {
            return Err(HfsError::Busy);
        }
        st.mode_change = true;
        while !st.quiescent() {
            self.changed.wait(&mut st);
        }
        Ok(())
    }

    pub(crate) fn end_mode_change(&self, read_only: bool) {
        let mut st = self.inner.lock();
        st.mode_change = false;
        st.read_only = read_only;
        st.phase = st.mounted();
        drop(st);
        self.changed.notify_all();
    }

    /// Enter `Unmounting` once writers and syncers have left.
    pub(crate) fn begin_unmount(&self) -> Result<()> {
        let mut st = self.inner.lock();
        match st.phase {
            MountPhase::Mounted { .. } if !st.mode_change => {}
            _ => return Err(HfsError::Busy),
        }
        st.phase = MountPhase::Unmounting;
        while !st.quiescent() {
            self.changed.wait(&mut st);
        }
        Ok(())
    }

    pub(crate) fn finish_unmount(&self) {
        self.inner.lock().phase = MountPhase::Unmounted;
        self.changed.notify_all();
    }

    /// Record the current free level; returns the previous one when it
    /// changed.
    pub(crate) fn note_free_level(&self, level: FreeSpaceLevel) -> Option<FreeSpaceLevel> {
        let mut st = self.inner.lock();
        let old = std::mem::replace(&mut st.free_level, level);
        (old != level).then_some(old)
    }

    fn leave(&self, f: impl FnOnce(&mut MutexGuard<'_, StateInner>)) {
        let mut st = self.inner.lock();
        f(&mut st);
        drop(st);
        self.changed.notify_all();
    }
}

/// One admitted write operation.
#[derive(Debug)]
pub(crate) struct WriterGuard<'a> {
    state: &'a VolumeState,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.state.leave(|st| st.writers = st.writers.saturating_sub(1));
    }
}

/// One admitted syncer; the last one out wakes a waiting freezer.
#[derive(Debug)]
pub(crate) struct SyncGuard<'a> {
    state: &'a VolumeState,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.state.leave(|st| st.syncers = st.syncers.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn header() -> VolumeHeader {
        VolumeHeader {
            total_blocks: 1000,
            block_size: 4096,
            ..VolumeHeader::default()
        }
    }

    fn mounted(read_only: bool) -> VolumeState {
        let state = VolumeState::new(header(), read_only);
        state.set_mounted(read_only);
        state
    }

    #[test]
    fn thresholds_take_the_smaller_limit() {
        // 1 GiB volume of 4 KiB blocks: percentages win.
        let t = FreeSpaceThresholds::for_volume(262_144, 4096);
        assert_eq!(t.danger, 2621);
        assert_eq!(t.warning, 5242);
        assert_eq!(t.near_warning, 26214);
        assert_eq!(t.level(100), FreeSpaceLevel::Danger);
        assert_eq!(t.level(3000), FreeSpaceLevel::Warning);
        assert_eq!(t.level(200_000), FreeSpaceLevel::Ample);

        // 1 TiB volume: byte limits win.
        let big = FreeSpaceThresholds::for_volume(268_435_456, 4096);
        assert_eq!(big.danger, 38_400);
        assert!(big.danger < big.warning && big.warning < big.near_warning);
    }

    #[test]
    fn read_only_refuses_writers() {
        let state = mounted(true);
        assert!(matches!(state.enter_writer(), Err(HfsError::ReadOnly)));
        assert!(matches!(state.begin_sync(), Err(HfsError::ReadOnly)));
    }

    #[test]
    fn mark_inconsistent_reports_first_transition_only() {
        let state = mounted(false);
        assert!(state.mark_inconsistent(InconsistentReason::DetectedCorruption));
        assert!(!state.mark_inconsistent(InconsistentReason::FsckRequested));
        assert!(state.header().is_inconsistent());
        assert!(state.is_dirty());
    }

    #[test]
    fn flush_keeps_dirty_when_header_changed_behind_it() {
        let state = mounted(false);
        state.update_header(|h| h.file_count += 1);
        let snap = state.snapshot(true).expect("dirty");
        state.update_header(|h| h.file_count += 1);
        state.flushed(snap.generation, false, &snap.header);
        assert!(state.is_dirty());
        let snap = state.snapshot(true).expect("still dirty");
        state.flushed(snap.generation, false, &snap.header);
        assert!(state.snapshot(true).is_none());
    }

    #[test]
    fn interrupted_freeze_returns_to_mounted() {
        let state = mounted(false);
        let writer = state.enter_writer().expect("writer");
        let cx = Cx::for_testing();
        cx.set_cancel_requested(true);
        assert!(matches!(state.begin_freeze(&cx), Err(HfsError::Interrupted)));
        assert_eq!(state.phase(), MountPhase::Mounted { read_only: false });
        drop(writer);

        state.begin_freeze(&Cx::for_testing()).expect("freeze");
        state.finish_freeze();
        assert_eq!(state.phase(), MountPhase::Frozen);
        assert!(state.begin_sync().expect("sync").is_none());
        assert!(state.begin_thaw());
        assert_eq!(state.phase(), MountPhase::Thawing);
        state.finish_thaw();
        assert!(!state.begin_thaw());
    }

    #[test]
    fn frozen_volume_holds_writers_until_thaw() {
        let state = Arc::new(mounted(false));
        state.begin_freeze(&Cx::for_testing()).expect("freeze");
        state.finish_freeze();

        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                let _writer = state.enter_writer().expect("writer after thaw");
                state.phase()
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(state.writers(), 0);
        assert!(state.begin_thaw());
        state.finish_thaw();
        let phase = waiter.join().expect("join");
        assert_eq!(phase, MountPhase::Mounted { read_only: false });
    }

    #[test]
    fn freeze_waits_for_last_syncer() {
        let state = Arc::new(mounted(false));
        let sync = state.begin_sync().expect("sync").expect("admitted");
        let freezer = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.begin_freeze(&Cx::for_testing()))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(state.phase(), MountPhase::Freezing);
        drop(sync);
        freezer.join().expect("join").expect("freeze");
    }
}
