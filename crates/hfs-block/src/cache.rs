//! Node-buffer arena.
//!
//! # Ownership model
//!
//! | State | `Entry::data` | Evictable | Written by |
//! |-------|---------------|-----------|------------|
//! | Clean, idle | `Some` | yes | nobody |
//! | Checked out | `None` (held by a [`BufGuard`]) | no | guard holder |
//! | Dirty, idle | `Some` | yes, after write-back | flush / eviction |
//! | Journal-pinned | `Some` or `None` | no | journal checkpoint |
//!
//! A buffer is checked out by exactly one [`BufGuard`] at a time. Other
//! threads asking for the same buffer wait on a condition variable; the
//! holding thread asking again is an invariant violation.
//!
//! Bytes held in the arena are in whichever order the last writer left
//! them: finishers run in place when a dirty buffer is written back, so an
//! idle buffer is either host order or disk order, never mixed.

use crate::arc::ArcState;
use crate::{BlockCacheError, ByteDevice};
use hfs_error::HfsError;
use hfs_types::{ByteOffset, FileId};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, error, trace, warn};

type CacheResult<T> = std::result::Result<T, BlockCacheError>;

// ── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Node buffers kept resident before ARC eviction starts.
    ///
    /// Default: 1024.
    pub capacity_nodes: usize,
    /// Deferred dirty buffers allowed before a release forces a synchronous
    /// flush.
    ///
    /// Default: 256.
    pub max_dirty_buffers: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_nodes: 1024,
            max_dirty_buffers: 256,
        }
    }
}

// ── Public types ───────────────────────────────────────────────────────────

/// Converts a node to disk order just before its bytes leave memory.
pub trait NodeFinisher: Send + Sync + fmt::Debug {
    fn finish(&self, data: &mut [u8]) -> hfs_error::Result<()>;
}

/// Identity of a cached buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufKey {
    pub file: FileId,
    /// Block number within `file` (node number for B-tree files).
    pub block: u64,
}

impl BufKey {
    #[must_use]
    pub fn new(file: FileId, block: u64) -> Self {
        Self { file, block }
    }
}

impl fmt::Display for BufKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.block)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMode {
    /// Return cached bytes or read them from the device.
    Read,
    /// Return a zero-filled buffer without reading (new nodes).
    Empty,
}

/// How a checked-out buffer goes back to the arena.
#[derive(Debug, Clone)]
pub enum ReleaseMode {
    /// Drop the cached copy without writing it.
    Trash,
    /// Write synchronously (finisher first), leave the buffer clean.
    ForceWrite(Option<Arc<dyn NodeFinisher>>),
    /// Keep for a deferred write; the finisher runs at write-back time.
    MarkDirty(Option<Arc<dyn NodeFinisher>>),
    /// Return unchanged; an existing dirty state is kept.
    Plain,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
    pub forced_flushes: u64,
    pub resident: usize,
    pub dirty: usize,
}

// ── Arena state ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Entry {
    data: Option<Vec<u8>>,
    len: usize,
    dev_offset: ByteOffset,
    dirty: bool,
    journal_pins: u32,
    finisher: Option<Arc<dyn NodeFinisher>>,
    owner: Option<ThreadId>,
    /// Invalidated while checked out; dropped on release.
    stale: bool,
}

impl Entry {
    fn is_evictable(&self) -> bool {
        self.data.is_some() && self.journal_pins == 0
    }
}

#[derive(Debug)]
struct CacheState {
    arc: ArcState<BufKey>,
    entries: HashMap<BufKey, Entry>,
    dirty_count: usize,
    metrics: CacheMetrics,
}

struct CacheInner {
    device: Arc<dyn ByteDevice>,
    config: CacheConfig,
    state: Mutex<CacheState>,
    released: Condvar,
}

impl fmt::Debug for CacheInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheInner")
            .field("device", &self.device)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Shared handle to the node-buffer arena.
#[derive(Debug, Clone)]
pub struct BufferCache {
    inner: Arc<CacheInner>,
}

fn write_back(
    device: &dyn ByteDevice,
    key: BufKey,
    entry: &mut Entry,
    data: &mut [u8],
) -> CacheResult<()> {
    if let Some(finisher) = entry.finisher.clone() {
        finisher.finish(data).map_err(|source| {
            error!(target: "hfs::cache", file = %key.file, block = key.block, %source, "cache_finisher_failed");
            BlockCacheError::Finish {
                file: key.file,
                block: key.block,
                source,
            }
        })?;
        entry.finisher = None;
    }
    device
        .write_all_at(entry.dev_offset, data)
        .map_err(BlockCacheError::Device)?;
    entry.dirty = false;
    trace!(target: "hfs::cache", file = %key.file, block = key.block, offset = entry.dev_offset.0, "cache_write_back");
    Ok(())
}

impl BufferCache {
    pub fn new(device: Arc<dyn ByteDevice>, config: CacheConfig) -> Self {
        let capacity = config.capacity_nodes.max(1);
        Self {
            inner: Arc::new(CacheInner {
                device,
                config,
                state: Mutex::new(CacheState {
                    arc: ArcState::new(capacity),
                    entries: HashMap::new(),
                    dirty_count: 0,
                    metrics: CacheMetrics::default(),
                }),
                released: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn ByteDevice> {
        &self.inner.device
    }

    #[must_use]
    pub fn config(&self) -> CacheConfig {
        self.inner.config
    }

    // ── Checkout ────────────────────────────────────────────────────────

    /// Check out the buffer `key` of `len` bytes at `dev_offset`.
    ///
    /// Blocks while another thread holds the buffer. A cached copy of a
    /// different size is re-read when it is clean and unpinned, otherwise
    /// [`BlockCacheError::SizeMismatch`] is returned.
    pub fn get(
        &self,
        key: BufKey,
        dev_offset: ByteOffset,
        len: usize,
        mode: GetMode,
    ) -> CacheResult<BufGuard> {
        let me = thread::current().id();
        let mut state = self.inner.state.lock();

        loop {
            let Some(entry) = state.entries.get_mut(&key) else {
                break;
            };
            if entry.data.is_none() {
                if entry.owner == Some(me) {
                    error!(target: "hfs::cache", invariant = "single_checkout", file = %key.file, block = key.block, "cache_invariant_violation");
                    return Err(BlockCacheError::Recursive {
                        file: key.file,
                        block: key.block,
                    });
                }
                self.inner.released.wait(&mut state);
                continue;
            }
            if entry.len != len {
                if entry.dirty || entry.journal_pins > 0 {
                    return Err(BlockCacheError::SizeMismatch {
                        file: key.file,
                        block: key.block,
                        cached: entry.len,
                        requested: len,
                    });
                }
                debug!(target: "hfs::cache", file = %key.file, block = key.block, cached = entry.len, requested = len, "cache_size_change_reread");
                let _ = state.entries.remove(&key);
                state.arc.forget(&key);
                break;
            }

            let mut data = entry.data.take().unwrap_or_default();
            entry.owner = Some(me);
            if mode == GetMode::Empty {
                data.fill(0);
            }
            state.arc.on_hit(key);
            state.metrics.hits += 1;
            drop(state);
            trace!(target: "hfs::cache", file = %key.file, block = key.block, "cache_hit");
            return Ok(BufGuard {
                cache: self.clone(),
                key,
                dev_offset,
                data,
                from_disk: false,
                released: false,
            });
        }

        // Miss: reserve the slot so concurrent getters wait for our read.
        state.metrics.misses += 1;
        if let Err(err) = self.admit(&mut state, key) {
            state.arc.forget(&key);
            return Err(err);
        }
        state.entries.insert(
            key,
            Entry {
                data: None,
                len,
                dev_offset,
                dirty: false,
                journal_pins: 0,
                finisher: None,
                owner: Some(me),
                stale: false,
            },
        );
        drop(state);

        let mut data = vec![0_u8; len];
        let from_disk = match mode {
            GetMode::Empty => false,
            GetMode::Read => {
                if let Err(source) = self.inner.device.read_exact_at(dev_offset, &mut data) {
                    warn!(target: "hfs::cache", file = %key.file, block = key.block, offset = dev_offset.0, %source, "cache_read_failed");
                    let mut state = self.inner.state.lock();
                    let _ = state.entries.remove(&key);
                    state.arc.forget(&key);
                    drop(state);
                    self.inner.released.notify_all();
                    return Err(BlockCacheError::Unavailable {
                        file: key.file,
                        block: key.block,
                        source,
                    });
                }
                true
            }
        };
        trace!(target: "hfs::cache", file = %key.file, block = key.block, from_disk, "cache_miss");
        Ok(BufGuard {
            cache: self.clone(),
            key,
            dev_offset,
            data,
            from_disk,
            released: false,
        })
    }

    /// Make room for `key`, writing back dirty victims.
    fn admit(&self, state: &mut CacheState, key: BufKey) -> CacheResult<()> {
        let CacheState {
            arc,
            entries,
            dirty_count,
            metrics,
        } = state;
        let victims = arc.admit(key, &|k| entries.get(k).is_some_and(Entry::is_evictable));
        for victim in victims {
            let Some(mut entry) = entries.remove(&victim) else {
                continue;
            };
            metrics.evictions += 1;
            if entry.dirty {
                let mut data = entry.data.take().unwrap_or_default();
                if let Err(err) = write_back(self.inner.device.as_ref(), victim, &mut entry, &mut data)
                {
                    // Keep the dirty buffer resident; it is retried on flush.
                    entry.data = Some(data);
                    entries.insert(victim, entry);
                    let _ = arc.admit(victim, &|_| false);
                    return Err(err);
                }
                *dirty_count = dirty_count.saturating_sub(1);
                metrics.writebacks += 1;
            }
            trace!(target: "hfs::cache", file = %victim.file, block = victim.block, "cache_evict");
        }
        Ok(())
    }

    fn release(&self, guard: &mut BufGuard, mode: ReleaseMode) -> CacheResult<()> {
        let key = guard.key;
        let mut data = std::mem::take(&mut guard.data);
        let max_dirty = self.inner.config.max_dirty_buffers;
        let mut state = self.inner.state.lock();
        let st = &mut *state;
        let mut over_limit = false;

        let result = match st.entries.get_mut(&key) {
            None => Ok(()),
            Some(entry) => {
                entry.owner = None;
                entry.dev_offset = guard.dev_offset;
                let trash = entry.stale || matches!(mode, ReleaseMode::Trash);
                if trash && entry.journal_pins > 0 {
                    entry.data = Some(data);
                    entry.stale = false;
                    error!(target: "hfs::cache", invariant = "trash_unpinned", file = %key.file, block = key.block, "cache_invariant_violation");
                    Err(BlockCacheError::JournalPinned {
                        file: key.file,
                        block: key.block,
                    })
                } else if trash {
                    if entry.dirty {
                        st.dirty_count = st.dirty_count.saturating_sub(1);
                    }
                    let _ = st.entries.remove(&key);
                    st.arc.forget(&key);
                    trace!(target: "hfs::cache", file = %key.file, block = key.block, "cache_trash");
                    Ok(())
                } else {
                    match mode {
                        ReleaseMode::Trash | ReleaseMode::Plain => {
                            entry.data = Some(data);
                            Ok(())
                        }
                        ReleaseMode::MarkDirty(finisher) => {
                            if !entry.dirty {
                                entry.dirty = true;
                                st.dirty_count += 1;
                            }
                            entry.finisher = finisher;
                            entry.data = Some(data);
                            over_limit = st.dirty_count > max_dirty;
                            Ok(())
                        }
                        ReleaseMode::ForceWrite(finisher) => {
                            if finisher.is_some() {
                                entry.finisher = finisher;
                            }
                            let was_dirty = entry.dirty;
                            let outcome =
                                write_back(self.inner.device.as_ref(), key, entry, &mut data);
                            entry.data = Some(data);
                            if outcome.is_ok() {
                                if was_dirty {
                                    st.dirty_count = st.dirty_count.saturating_sub(1);
                                }
                                st.metrics.writebacks += 1;
                            }
                            outcome
                        }
                    }
                }
            }
        };
        drop(state);
        self.inner.released.notify_all();
        result?;

        if over_limit {
            self.enforce_dirty_limit()?;
        }
        Ok(())
    }

    fn enforce_dirty_limit(&self) -> CacheResult<()> {
        let limit = self.inner.config.max_dirty_buffers;
        debug!(target: "hfs::cache", limit, "cache_dirty_limit_flush");
        self.inner.state.lock().metrics.forced_flushes += 1;
        self.flush_dirty()?;
        let dirty = self.inner.state.lock().dirty_count;
        if dirty > limit {
            warn!(target: "hfs::cache", limit, dirty, "cache_dirty_limit_exceeded");
            return Err(BlockCacheError::DirtyLimit { limit });
        }
        Ok(())
    }

    // ── Flush ───────────────────────────────────────────────────────────

    /// Write back every idle dirty buffer; returns how many were written.
    pub fn flush_dirty(&self) -> CacheResult<usize> {
        self.flush_matching(|_| true)
    }

    /// Write back idle dirty buffers of one file.
    pub fn flush_file(&self, file: FileId) -> CacheResult<usize> {
        self.flush_matching(|key| key.file == file)
    }

    fn flush_matching(&self, filter: impl Fn(&BufKey) -> bool) -> CacheResult<usize> {
        let mut state = self.inner.state.lock();
        let mut keys: Vec<BufKey> = state
            .entries
            .iter()
            .filter(|(k, e)| e.dirty && e.data.is_some() && e.journal_pins == 0 && filter(k))
            .map(|(k, _)| *k)
            .collect();
        keys.sort();

        let mut written = 0;
        for key in keys {
            let Some(entry) = state.entries.get_mut(&key) else {
                continue;
            };
            let mut data = entry.data.take().unwrap_or_default();
            let outcome = write_back(self.inner.device.as_ref(), key, entry, &mut data);
            entry.data = Some(data);
            outcome?;
            state.dirty_count = state.dirty_count.saturating_sub(1);
            state.metrics.writebacks += 1;
            written += 1;
        }
        drop(state);
        if written > 0 {
            debug!(target: "hfs::cache", written, "cache_flush");
        }
        Ok(written)
    }

    // ── Journal pins ────────────────────────────────────────────────────

    /// Add one journal pin; the buffer is neither evicted nor written back
    /// until every pin is removed.
    pub fn journal_pin(&self, key: BufKey) -> CacheResult<()> {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.entries.get_mut(&key) else {
            error!(target: "hfs::cache", invariant = "pin_resident", file = %key.file, block = key.block, "cache_invariant_violation");
            return Err(BlockCacheError::NotPinned {
                file: key.file,
                block: key.block,
            });
        };
        entry.journal_pins += 1;
        if entry.dirty {
            // The journal now owns writing this buffer.
            entry.dirty = false;
            entry.finisher = None;
            state.dirty_count = state.dirty_count.saturating_sub(1);
        }
        Ok(())
    }

    pub fn journal_unpin(&self, key: BufKey) -> CacheResult<()> {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.entries.get_mut(&key) else {
            return Err(BlockCacheError::NotPinned {
                file: key.file,
                block: key.block,
            });
        };
        if entry.journal_pins == 0 {
            error!(target: "hfs::cache", invariant = "unpin_pinned", file = %key.file, block = key.block, "cache_invariant_violation");
            return Err(BlockCacheError::NotPinned {
                file: key.file,
                block: key.block,
            });
        }
        entry.journal_pins -= 1;
        if entry.journal_pins == 0 && entry.stale && entry.data.is_some() {
            let _ = state.entries.remove(&key);
            state.arc.forget(&key);
        }
        drop(state);
        self.inner.released.notify_all();
        Ok(())
    }

    #[must_use]
    pub fn journal_pins(&self, key: BufKey) -> u32 {
        self.inner
            .state
            .lock()
            .entries
            .get(&key)
            .map_or(0, |e| e.journal_pins)
    }

    // ── Invalidation ────────────────────────────────────────────────────

    /// Drop a cached buffer. A checked-out buffer is dropped on release.
    pub fn invalidate(&self, key: BufKey) -> CacheResult<()> {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.entries.get_mut(&key) else {
            return Ok(());
        };
        if entry.journal_pins > 0 {
            return Err(BlockCacheError::JournalPinned {
                file: key.file,
                block: key.block,
            });
        }
        if entry.data.is_none() {
            entry.stale = true;
            return Ok(());
        }
        if entry.dirty {
            state.dirty_count = state.dirty_count.saturating_sub(1);
        }
        let _ = state.entries.remove(&key);
        state.arc.forget(&key);
        Ok(())
    }

    /// Drop every idle, unpinned buffer of `file` (dirty ones are written
    /// back first).
    pub fn invalidate_file(&self, file: FileId) -> CacheResult<()> {
        let _ = self.flush_file(file)?;
        let mut state = self.inner.state.lock();
        let keys: Vec<BufKey> = state
            .entries
            .iter()
            .filter(|(k, e)| k.file == file && e.is_evictable() && !e.dirty)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            let _ = state.entries.remove(&key);
            state.arc.forget(&key);
        }
        Ok(())
    }

    // ── Introspection ───────────────────────────────────────────────────

    #[must_use]
    pub fn contains(&self, key: BufKey) -> bool {
        self.inner.state.lock().entries.contains_key(&key)
    }

    #[must_use]
    pub fn is_dirty(&self, key: BufKey) -> bool {
        self.inner
            .state
            .lock()
            .entries
            .get(&key)
            .is_some_and(|e| e.dirty)
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.inner.state.lock().dirty_count
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let state = self.inner.state.lock();
        CacheMetrics {
            resident: state.entries.len(),
            dirty: state.dirty_count,
            ..state.metrics
        }
    }
}

// ── Guard ──────────────────────────────────────────────────────────────────

/// Exclusive checkout of one cached buffer.
///
/// Dropping the guard performs a [`ReleaseMode::Plain`] release.
pub struct BufGuard {
    cache: BufferCache,
    key: BufKey,
    dev_offset: ByteOffset,
    data: Vec<u8>,
    from_disk: bool,
    released: bool,
}

impl fmt::Debug for BufGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufGuard")
            .field("key", &self.key)
            .field("dev_offset", &self.dev_offset)
            .field("len", &self.data.len())
            .field("from_disk", &self.from_disk)
            .finish()
    }
}

impl BufGuard {
    #[must_use]
    pub fn key(&self) -> BufKey {
        self.key
    }

    #[must_use]
    pub fn dev_offset(&self) -> ByteOffset {
        self.dev_offset
    }

    /// True when the bytes were just read from the device (disk order).
    #[must_use]
    pub fn is_from_disk(&self) -> bool {
        self.from_disk
    }

    /// Copy of the bytes with `finisher` applied, leaving the buffer as is.
    pub fn finished_copy(
        &self,
        finisher: Option<&Arc<dyn NodeFinisher>>,
    ) -> Result<Vec<u8>, BlockCacheError> {
        let mut copy = self.data.clone();
        if let Some(finisher) = finisher {
            finisher
                .finish(&mut copy)
                .map_err(|source: HfsError| BlockCacheError::Finish {
                    file: self.key.file,
                    block: self.key.block,
                    source,
                })?;
        }
        Ok(copy)
    }

    /// Return the buffer to the arena.
    pub fn release(mut self, mode: ReleaseMode) -> Result<(), BlockCacheError> {
        self.released = true;
        let cache = self.cache.clone();
        cache.release(&mut self, mode)
    }
}

impl Deref for BufGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for BufGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for BufGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            let cache = self.cache.clone();
            if let Err(err) = cache.release(self, ReleaseMode::Plain) {
                error!(target: "hfs::cache", file = %self.key.file, block = self.key.block, %err, "cache_release_on_drop_failed");
            }
        }
    }
}
