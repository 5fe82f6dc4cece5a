//! Transaction lifecycle, commit and checkpoint.
//!
//! | Phase | Entered by | Left by |
//! |-------|------------|---------|
//! | `Idle` | commit finished, journal opened | [`Journal::begin`] |
//! | `Active` | [`Journal::begin`] | [`Transaction::commit`] |
//! | `Committing` | [`Transaction::commit`] | record durable, or failure |
//!
//! One transaction is active per journal; other threads calling `begin`
//! wait. A block is journal-pinned in the buffer cache from its first
//! `modify_start` until the checkpoint that writes the transaction's copy
//! home. Committed transactions stay pending until a checkpoint, which runs
//! on [`Journal::flush`], under ring pressure, or when more than
//! `max_pending_transactions` are waiting.
//!
//! A journal without a ring runs in direct mode: `modify_end` writes the
//! block home synchronously and commit only issues trims.

use crate::JournalError;
use crate::format::{ByteOrder, JOURNAL_HEADER_LEN, JournalHeader, encode_transaction};
use crate::replay::{self, ReplayReport};
use crate::ring::Ring;
use hfs_block::{BufGuard, BufKey, BufferCache, NodeFinisher, ReleaseMode};
use hfs_types::ByteOffset;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, error, info, trace, warn};

type JournalResult<T> = std::result::Result<T, JournalError>;

// ── Configuration ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Distinct blocks one transaction may modify.
    ///
    /// Default: 1024.
    pub max_transaction_blocks: usize,
    /// Committed transactions kept in memory before a checkpoint.
    ///
    /// Default: 8.
    pub max_pending_transactions: usize,
    /// Block size used when creating a journal. Opening an existing journal
    /// uses the size recorded in its header.
    ///
    /// Default: 512.
    pub journal_block_size: u32,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            max_transaction_blocks: 1024,
            max_pending_transactions: 8,
            journal_block_size: 512,
        }
    }
}

// ── Public types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalPhase {
    Idle,
    Active,
    Committing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalStats {
    pub commits: u64,
    pub empty_commits: u64,
    pub blocks_logged: u64,
    pub checkpoints: u64,
    pub replayed_transactions: u64,
}

/// In-memory view of the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingState {
    pub start: u64,
    pub end: u64,
    /// Sequence of the transaction at `start`.
    pub sequence: u32,
    pub next_sequence: u32,
    pub pending: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitInfo {
    /// `None` for empty and direct-mode commits, which write no record.
    pub sequence: Option<u32>,
    pub blocks: usize,
}

/// Receives freed device ranges once the transaction that freed them is
/// durable.
pub type TrimCallback = Box<dyn Fn(&[(ByteOffset, u64)]) + Send + Sync>;

// ── State ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct StagedBlock {
    key: BufKey,
    dev_offset: ByteOffset,
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct PendingTxn {
    sequence: u32,
    /// Ring position just past this transaction's record.
    end: u64,
    blocks: Vec<StagedBlock>,
}

#[derive(Debug)]
struct JournalState {
    phase: JournalPhase,
    owner: Option<ThreadId>,
    poisoned: bool,
    closed: bool,
    start: u64,
    end: u64,
    sequence: u32,
    next_sequence: u32,
    pending: VecDeque<PendingTxn>,
    stats: JournalStats,
}

impl JournalState {
    fn new(start: u64, end: u64, sequence: u32) -> Self {
        Self {
            phase: JournalPhase::Idle,
            owner: None,
            poisoned: false,
            closed: false,
            start,
            end,
            sequence,
            next_sequence: sequence,
            pending: VecDeque::new(),
            stats: JournalStats::default(),
        }
    }
}

pub struct Journal {
    cache: BufferCache,
    config: JournalConfig,
    ring: Option<Ring>,
    state: Mutex<JournalState>,
    idle: Condvar,
    trim: Mutex<Option<TrimCallback>>,
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("config", &self.config)
            .field("ring", &self.ring)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

fn decode_header(
    cache: &BufferCache,
    base: ByteOffset,
    size: u64,
) -> JournalResult<(JournalHeader, ByteOrder)> {
    let mut buf = vec![0_u8; JOURNAL_HEADER_LEN];
    cache.device().read_exact_at(base, &mut buf)?;
    let (header, order) = JournalHeader::decode(&buf).map_err(|err| {
        error!(target: "hfs::journal", base = base.0, %err, "journal_header_invalid");
        JournalError::Corrupt {
            offset: 0,
            detail: err.to_string(),
        }
    })?;
    if header.size != size {
        error!(target: "hfs::journal", recorded = header.size, expected = size, "journal_size_mismatch");
        return Err(JournalError::Corrupt {
            offset: 0,
            detail: format!(
                "journal header size {} does not match info block size {size}",
                header.size
            ),
        });
    }
    Ok((header, order))
}

impl Journal {
    fn with_state(
        cache: BufferCache,
        config: JournalConfig,
        ring: Option<Ring>,
        state: JournalState,
    ) -> Self {
        Self {
            cache,
            config,
            ring,
            state: Mutex::new(state),
            idle: Condvar::new(),
            trim: Mutex::new(None),
        }
    }

    /// Journal for a volume without one: blocks go straight home.
    #[must_use]
    pub fn direct(cache: BufferCache, config: JournalConfig) -> Self {
        Self::with_state(cache, config, None, JournalState::new(0, 0, 0))
    }

    /// Format an empty journal of `size` bytes at device offset `base`.
    pub fn create(
        cache: BufferCache,
        base: ByteOffset,
        size: u64,
        config: JournalConfig,
    ) -> JournalResult<Self> {
        let block_size = u64::from(config.journal_block_size);
        let ring = Ring::new(Arc::clone(cache.device()), base, block_size, size, block_size)?;
        ring.zero()?;
        let header = JournalHeader {
            start: ring.header_size(),
            end: ring.header_size(),
            size,
            block_size: config.journal_block_size,
            header_size: config.journal_block_size,
            sequence: 1,
        };
        ring.write_header(&header.encode(ByteOrder::Big))?;
        ring.sync()?;
        info!(target: "hfs::journal", base = base.0, size, block_size, "journal_create");
        let state = JournalState::new(header.start, header.end, header.sequence);
        Ok(Self::with_state(cache, config, Some(ring), state))
    }

    /// Open an existing journal, replaying committed transactions.
    ///
    /// Must run before any cached copy of a logged block is used.
    pub fn open(
        cache: BufferCache,
        base: ByteOffset,
        size: u64,
        config: JournalConfig,
    ) -> JournalResult<(Self, ReplayReport)> {
        let (header, order) = decode_header(&cache, base, size)?;
        let ring = Ring::new(
            Arc::clone(cache.device()),
            base,
            u64::from(header.header_size),
            size,
            u64::from(header.block_size),
        )?;
        if !ring.contains(header.start) || !ring.contains(header.end) {
            error!(target: "hfs::journal", start = header.start, end = header.end, "journal_header_out_of_range");
            return Err(JournalError::Corrupt {
                offset: 0,
                detail: format!("start {} / end {} outside ring", header.start, header.end),
            });
        }

        let outcome = replay::replay(&ring, &header, order)?;
        let fresh = JournalHeader {
            start: outcome.end,
            end: outcome.end,
            sequence: outcome.next_sequence,
            ..header
        };
        if outcome.report.transactions > 0 || order == ByteOrder::Little {
            ring.write_header(&fresh.encode(ByteOrder::Big))?;
            ring.sync()?;
        }

        let mut state = JournalState::new(fresh.start, fresh.end, fresh.sequence);
        state.stats.replayed_transactions = outcome.report.transactions as u64;
        info!(
            target: "hfs::journal",
            base = base.0,
            size,
            block_size = header.block_size,
            sequence = fresh.sequence,
            replayed = outcome.report.transactions,
            "journal_open"
        );
        Ok((
            Self::with_state(cache, config, Some(ring), state),
            outcome.report,
        ))
    }

    #[must_use]
    pub fn is_logged(&self) -> bool {
        self.ring.is_some()
    }

    #[must_use]
    pub fn cache(&self) -> &BufferCache {
        &self.cache
    }

    #[must_use]
    pub fn config(&self) -> JournalConfig {
        self.config
    }

    #[must_use]
    pub fn phase(&self) -> JournalPhase {
        self.state.lock().phase
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    #[must_use]
    pub fn stats(&self) -> JournalStats {
        self.state.lock().stats
    }

    #[must_use]
    pub fn ring_state(&self) -> RingState {
        let st = self.state.lock();
        RingState {
            start: st.start,
            end: st.end,
            sequence: st.sequence,
            next_sequence: st.next_sequence,
            pending: st.pending.len(),
        }
    }

    pub fn set_trim_callback(&self, callback: TrimCallback) {
        *self.trim.lock() = Some(callback);
    }

    // ── Transactions ────────────────────────────────────────────────────

    /// Start a transaction, waiting while another thread has one open.
    pub fn begin(&self) -> JournalResult<Transaction<'_>> {
        let me = thread::current().id();
        let mut st = self.state.lock();
        loop {
            if st.poisoned {
                return Err(JournalError::Poisoned);
            }
            if st.closed {
                return Err(JournalError::Closed);
            }
            if st.phase == JournalPhase::Idle {
                break;
            }
            if st.owner == Some(me) {
                error!(target: "hfs::journal", invariant = "single_transaction", "journal_invariant_violation");
                return Err(JournalError::Recursive);
            }
            self.idle.wait(&mut st);
        }
        st.phase = JournalPhase::Active;
        st.owner = Some(me);
        drop(st);
        trace!(target: "hfs::journal", "journal_begin");
        Ok(Transaction {
            journal: self,
            started: HashSet::new(),
            pinned: HashSet::new(),
            staged: Vec::new(),
            staged_index: HashMap::new(),
            trims: Vec::new(),
            done: false,
        })
    }

    fn release_active(&self) {
        let mut st = self.state.lock();
        st.phase = JournalPhase::Idle;
        st.owner = None;
        drop(st);
        self.idle.notify_all();
    }

    fn poison(&self, reason: &'static str) {
        let mut st = self.state.lock();
        st.poisoned = true;
        st.phase = JournalPhase::Idle;
        st.owner = None;
        drop(st);
        self.idle.notify_all();
        error!(target: "hfs::journal", reason, "journal_poisoned");
    }

    fn issue_trims(&self, trims: &[(ByteOffset, u64)]) {
        if trims.is_empty() {
            return;
        }
        let callback = self.trim.lock();
        if let Some(callback) = callback.as_ref() {
            callback(trims);
        } else if let Err(err) = self.cache.device().trim(trims) {
            warn!(target: "hfs::journal", extents = trims.len(), %err, "journal_trim_failed");
        }
        trace!(target: "hfs::journal", extents = trims.len(), "journal_trim_issued");
    }

    fn commit_logged(&self, ring: &Ring, blocks: Vec<StagedBlock>) -> JournalResult<u32> {
        let mut st = self.state.lock();
        st.phase = JournalPhase::Committing;
        let sequence = st.next_sequence;
        let record = {
            let refs: Vec<(u64, &[u8])> = blocks
                .iter()
                .map(|b| (b.dev_offset.0, b.bytes.as_slice()))
                .collect();
            encode_transaction(sequence, &refs, ring.block_size(), ByteOrder::Big).map_err(
                |_| JournalError::TransactionTooLarge {
                    blocks: blocks.len(),
                },
            )?
        };
        let need = record.len() as u64;
        if need > ring.max_record_len() {
            warn!(target: "hfs::journal", bytes = need, capacity = ring.max_record_len(), "journal_record_too_large");
            return Err(JournalError::TransactionTooLarge {
                blocks: blocks.len(),
            });
        }
        while ring.free(st.start, st.end) < need {
            if st.pending.is_empty() {
                return Err(JournalError::Full);
            }
            debug!(target: "hfs::journal", need, free = ring.free(st.start, st.end), "journal_ring_pressure");
            let all = st.pending.len();
            self.checkpoint_locked(ring, &mut st, all)?;
        }

        ring.write(st.end, &record)?;
        ring.sync()?;
        st.end = ring.advance(st.end, need);
        st.next_sequence = sequence.wrapping_add(1);
        let count = blocks.len();
        let end = st.end;
        st.pending.push_back(PendingTxn {
            sequence,
            end,
            blocks,
        });
        st.stats.commits += 1;
        st.stats.blocks_logged += count as u64;
        debug!(target: "hfs::journal", sequence, blocks = count, bytes = need, end = st.end, "journal_commit");

        let excess = st
            .pending
            .len()
            .saturating_sub(self.config.max_pending_transactions);
        let outcome = self.checkpoint_locked(ring, &mut st, excess);
        st.phase = JournalPhase::Idle;
        st.owner = None;
        drop(st);
        self.idle.notify_all();
        outcome.map(|()| sequence)
    }

    /// Write the oldest `count` pending transactions home, unpin their
    /// buffers and advance the on-disk start.
    fn checkpoint_locked(
        &self,
        ring: &Ring,
        st: &mut JournalState,
        count: usize,
    ) -> JournalResult<()> {
        let count = count.min(st.pending.len());
        if count == 0 {
            return Ok(());
        }
        for txn in st.pending.iter().take(count) {
            for block in &txn.blocks {
                ring.device_write(block.dev_offset, &block.bytes)?;
            }
        }
        ring.sync()?;

        let drained: Vec<PendingTxn> = st.pending.drain(..count).collect();
        let mut written = 0_usize;
        for txn in &drained {
            for block in &txn.blocks {
                self.cache.journal_unpin(block.key)?;
                written += 1;
            }
        }
        if let Some(last) = drained.last() {
            st.start = last.end;
        }
        st.sequence = st.pending.front().map_or(st.next_sequence, |t| t.sequence);
        self.write_header(ring, st)?;
        st.stats.checkpoints += 1;
        debug!(
            target: "hfs::journal",
            transactions = count,
            blocks = written,
            start = st.start,
            sequence = st.sequence,
            "journal_checkpoint"
        );
        Ok(())
    }

    fn write_header(&self, ring: &Ring, st: &JournalState) -> JournalResult<()> {
        let header = JournalHeader {
            start: st.start,
            end: st.end,
            size: ring.size(),
            block_size: u32::try_from(ring.block_size()).unwrap_or(self.config.journal_block_size),
            header_size: u32::try_from(ring.header_size())
                .unwrap_or(self.config.journal_block_size),
            sequence: st.sequence,
        };
        ring.write_header(&header.encode(ByteOrder::Big))?;
        ring.sync()?;
        Ok(())
    }

    /// Checkpoint every pending transaction, waiting for an active one to
    /// commit first.
    pub fn flush(&self) -> JournalResult<()> {
        let Some(ring) = &self.ring else {
            return Ok(());
        };
        let me = thread::current().id();
        let mut st = self.state.lock();
        while st.phase != JournalPhase::Idle {
            if st.owner == Some(me) {
                error!(target: "hfs::journal", invariant = "flush_outside_transaction", "journal_invariant_violation");
                return Err(JournalError::Recursive);
            }
            self.idle.wait(&mut st);
        }
        if st.poisoned {
            return Err(JournalError::Poisoned);
        }
        let all = st.pending.len();
        self.checkpoint_locked(ring, &mut st, all)
    }

    /// Flush and refuse further transactions.
    pub fn close(&self) -> JournalResult<()> {
        self.flush()?;
        let mut st = self.state.lock();
        st.closed = true;
        drop(st);
        self.idle.notify_all();
        info!(target: "hfs::journal", logged = self.is_logged(), "journal_close");
        Ok(())
    }
}

// ── Transaction ────────────────────────────────────────────────────────────

/// The journal's single open transaction.
///
/// Each modified block goes through [`modify_start`](Self::modify_start)
/// before its bytes change and [`modify_end`](Self::modify_end) after.
/// Dropping a transaction that touched blocks without committing poisons
/// the journal: the next mount replays as if it never started.
pub struct Transaction<'j> {
    journal: &'j Journal,
    /// Blocks between `modify_start` and `modify_end`.
    started: HashSet<BufKey>,
    /// Blocks this transaction holds a journal pin on.
    pinned: HashSet<BufKey>,
    staged: Vec<StagedBlock>,
    staged_index: HashMap<BufKey, usize>,
    trims: Vec<(ByteOffset, u64)>,
    done: bool,
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("started", &self.started.len())
            .field("pinned", &self.pinned.len())
            .field("staged", &self.staged.len())
            .field("trims", &self.trims.len())
            .finish()
    }
}

impl Transaction<'_> {
    #[must_use]
    pub fn journal(&self) -> &Journal {
        self.journal
    }

    #[must_use]
    pub fn staged_blocks(&self) -> usize {
        self.staged.len()
    }

    /// Announce that `guard`'s bytes are about to change.
    pub fn modify_start(&mut self, guard: &BufGuard) -> JournalResult<()> {
        let key = guard.key();
        if self.started.contains(&key) {
            error!(target: "hfs::journal", invariant = "modify_start_once", file = %key.file, block = key.block, "journal_invariant_violation");
            return Err(JournalError::AlreadyStarted {
                file: key.file,
                block: key.block,
            });
        }
        if self.journal.is_logged() && !self.pinned.contains(&key) {
            let limit = self.journal.config.max_transaction_blocks;
            if self.pinned.len() >= limit {
                warn!(target: "hfs::journal", limit, "journal_transaction_too_large");
                return Err(JournalError::TransactionTooLarge {
                    blocks: self.pinned.len() + 1,
                });
            }
            self.journal.cache.journal_pin(key)?;
            let _ = self.pinned.insert(key);
        }
        let _ = self.started.insert(key);
        trace!(target: "hfs::journal", file = %key.file, block = key.block, "journal_modify_start");
        Ok(())
    }

    /// Finish modifying a block. `finisher` converts the bytes to disk
    /// order once, when they leave memory.
    pub fn modify_end(
        &mut self,
        guard: BufGuard,
        finisher: Option<Arc<dyn NodeFinisher>>,
    ) -> JournalResult<()> {
        let key = guard.key();
        if !self.started.remove(&key) {
            error!(target: "hfs::journal", invariant = "modify_end_after_start", file = %key.file, block = key.block, "journal_invariant_violation");
            return Err(JournalError::NotStarted {
                file: key.file,
                block: key.block,
            });
        }
        if !self.journal.is_logged() {
            guard.release(ReleaseMode::ForceWrite(finisher))?;
            trace!(target: "hfs::journal", file = %key.file, block = key.block, "journal_direct_write");
            return Ok(());
        }

        let bytes = guard.finished_copy(finisher.as_ref())?;
        let dev_offset = guard.dev_offset();
        if let Some(&i) = self.staged_index.get(&key) {
            self.staged[i].bytes = bytes;
            self.staged[i].dev_offset = dev_offset;
        } else {
            let _ = self.staged_index.insert(key, self.staged.len());
            self.staged.push(StagedBlock {
                key,
                dev_offset,
                bytes,
            });
        }
        guard.release(ReleaseMode::Plain)?;
        trace!(target: "hfs::journal", file = %key.file, block = key.block, "journal_modify_end");
        Ok(())
    }

    /// Drop a block from the transaction and from the cache. Used for
    /// nodes freed by the same transaction that last modified them.
    pub fn kill_block(&mut self, guard: BufGuard) -> JournalResult<()> {
        let key = guard.key();
        let _ = self.started.remove(&key);
        if let Some(i) = self.staged_index.remove(&key) {
            let _ = self.staged.swap_remove(i);
            if let Some(moved) = self.staged.get(i) {
                let _ = self.staged_index.insert(moved.key, i);
            }
        }
        if self.pinned.remove(&key) {
            self.journal.cache.journal_unpin(key)?;
        }
        let mode = if self.journal.cache.journal_pins(key) == 0 {
            ReleaseMode::Trash
        } else {
            ReleaseMode::Plain
        };
        guard.release(mode)?;
        trace!(target: "hfs::journal", file = %key.file, block = key.block, "journal_kill_block");
        Ok(())
    }

    /// Queue a freed device range for trimming after this transaction is
    /// durable.
    pub fn add_trim(&mut self, offset: ByteOffset, len: u64) {
        if len > 0 {
            self.trims.push((offset, len));
        }
    }

    /// Withdraw any queued trim overlapping a range this transaction
    /// reallocated. Partially overlapping trims keep their outer pieces.
    pub fn cancel_trim(&mut self, offset: ByteOffset, len: u64) {
        let end = offset.0.saturating_add(len);
        let mut kept = Vec::with_capacity(self.trims.len());
        for &(start, trim_len) in &self.trims {
            let trim_end = start.0 + trim_len;
            if trim_end <= offset.0 || start.0 >= end {
                kept.push((start, trim_len));
                continue;
            }
            if start.0 < offset.0 {
                kept.push((start, offset.0 - start.0));
            }
            if trim_end > end {
                kept.push((ByteOffset(end), trim_end - end));
            }
        }
        self.trims = kept;
    }

    #[must_use]
    pub fn pending_trims(&self) -> &[(ByteOffset, u64)] {
        &self.trims
    }

    /// Make the transaction durable. A transaction with no staged blocks
    /// writes nothing.
    pub fn commit(mut self) -> JournalResult<CommitInfo> {
        self.done = true;
        if !self.started.is_empty() {
            let count = self.started.len();
            error!(target: "hfs::journal", invariant = "commit_after_modify_end", open_blocks = count, "journal_invariant_violation");
            self.journal.poison("commit with blocks still being modified");
            return Err(JournalError::StillModifying { count });
        }

        let unstaged: Vec<BufKey> = self
            .pinned
            .iter()
            .filter(|k| !self.staged_index.contains_key(k))
            .copied()
            .collect();
        for key in unstaged {
            if let Err(err) = self.journal.cache.journal_unpin(key) {
                self.journal.poison("unpin of unstaged block failed");
                return Err(err.into());
            }
        }
        let staged = std::mem::take(&mut self.staged);
        let trims = std::mem::take(&mut self.trims);

        let Some(ring) = &self.journal.ring else {
            self.journal.release_active();
            if !trims.is_empty() {
                self.journal.cache.device().sync()?;
            }
            self.journal.issue_trims(&trims);
            return Ok(CommitInfo {
                sequence: None,
                blocks: 0,
            });
        };

        if staged.is_empty() {
            self.journal.state.lock().stats.empty_commits += 1;
            self.journal.release_active();
            self.journal.issue_trims(&trims);
            trace!(target: "hfs::journal", "journal_empty_commit");
            return Ok(CommitInfo {
                sequence: None,
                blocks: 0,
            });
        }

        let blocks = staged.len();
        match self.journal.commit_logged(ring, staged) {
            Ok(sequence) => {
                self.journal.issue_trims(&trims);
                Ok(CommitInfo {
                    sequence: Some(sequence),
                    blocks,
                })
            }
            Err(err) => {
                self.journal.poison("commit failed");
                Err(err)
            }
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if self.started.is_empty() && self.pinned.is_empty() && self.staged.is_empty() {
            self.journal.release_active();
            return;
        }
        error!(
            target: "hfs::journal",
            started = self.started.len(),
            staged = self.staged.len(),
            "journal_transaction_abandoned"
        );
        self.journal.poison("transaction dropped before commit");
    }
}
