#![forbid(unsafe_code)]
//! Block I/O layer and node-buffer arena.
//!
//! Provides the [`ByteDevice`] trait the core uses as its only interface to
//! physical storage, file- and memory-backed devices, and the
//! [`BufferCache`]: an ARC-managed arena of node buffers keyed by
//! `(file, block)` with checkout guards, journal pin counts, deferred dirty
//! writes bounded by a dirty-buffer limit, and [`NodeFinisher`] hooks that
//! convert a node to disk order exactly when its bytes leave memory.

mod arc;
mod cache;

pub use cache::{
    BufGuard, BufKey, BufferCache, CacheConfig, CacheMetrics, GetMode, NodeFinisher, ReleaseMode,
};

use hfs_error::{HfsError, Result};
use hfs_types::{ByteOffset, FileId, VOLUME_HEADER_OFFSET, VOLUME_HEADER_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

// ── Errors ─────────────────────────────────────────────────────────────────

/// Errors raised by the buffer cache.
#[derive(Debug, Error)]
pub enum BlockCacheError {
    /// The device failed to produce the block.
    #[error("block unavailable: {file} block {block}: {source}")]
    Unavailable {
        file: FileId,
        block: u64,
        #[source]
        source: HfsError,
    },

    /// A cached buffer of a different size is held and cannot be re-read.
    #[error("size mismatch for {file} block {block}: cached {cached}, requested {requested}")]
    SizeMismatch {
        file: FileId,
        block: u64,
        cached: usize,
        requested: usize,
    },

    /// Journal unpin of a buffer that carries no journal pin.
    #[error("unpin of buffer {file} block {block} that is not pinned")]
    NotPinned { file: FileId, block: u64 },

    /// The calling thread already holds this buffer.
    #[error("buffer {file} block {block} already held by this thread")]
    Recursive { file: FileId, block: u64 },

    /// The buffer is pinned by an open or uncheckpointed transaction.
    #[error("buffer {file} block {block} is pinned by the journal")]
    JournalPinned { file: FileId, block: u64 },

    /// Dirty buffers still exceed the bound after a forced flush.
    #[error("dirty buffer limit reached ({limit})")]
    DirtyLimit { limit: usize },

    /// A node finisher rejected the buffer.
    #[error("finisher failed for {file} block {block}: {source}")]
    Finish {
        file: FileId,
        block: u64,
        #[source]
        source: HfsError,
    },

    /// Write-back failed.
    #[error("write-back failed: {0}")]
    Device(#[source] HfsError),
}

impl From<BlockCacheError> for HfsError {
    fn from(err: BlockCacheError) -> Self {
        match err {
            BlockCacheError::Unavailable { source, .. }
            | BlockCacheError::Finish { source, .. }
            | BlockCacheError::Device(source) => source,
            BlockCacheError::SizeMismatch {
                block,
                cached,
                requested,
                ..
            } => Self::Corruption {
                block,
                detail: format!("buffer size mismatch: cached {cached}, requested {requested}"),
            },
            BlockCacheError::NotPinned { .. }
            | BlockCacheError::Recursive { .. }
            | BlockCacheError::JournalPinned { .. } => Self::InvariantViolation(err.to_string()),
            BlockCacheError::DirtyLimit { limit } => Self::DirtyLimit { limit },
        }
    }
}

// ── Devices ────────────────────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync + std::fmt::Debug {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush the device write cache to stable storage.
    fn sync(&self) -> Result<()>;

    /// Logical sector size in bytes.
    fn logical_block_size(&self) -> u32 {
        512
    }

    /// Number of logical sectors.
    fn block_count(&self) -> u64 {
        self.len_bytes() / u64::from(self.logical_block_size())
    }

    /// Unmap `(offset, len)` byte ranges. Devices without discard support
    /// ignore the request.
    fn trim(&self, extents: &[(ByteOffset, u64)]) -> Result<()> {
        trace!(target: "hfs::cache", ranges = extents.len(), "device_trim_ignored");
        Ok(())
    }

    /// False when the device was opened read-only.
    fn is_writable(&self) -> bool {
        true
    }
}

fn check_range(offset: ByteOffset, len: usize, dev_len: u64, op: &str) -> Result<()> {
    let len = u64::try_from(len)
        .map_err(|_| HfsError::Format(format!("{op} length overflows u64")))?;
    let end = offset
        .checked_add(len)
        .ok_or_else(|| HfsError::Format(format!("{op} range overflows u64")))?;
    if end.0 > dev_len {
        return Err(HfsError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{op} out of bounds: offset={offset} len={len} device_len={dev_len}"),
        )));
    }
    Ok(())
}

/// File-backed byte device.
///
/// Opens read-write when permitted and falls back to read-only.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) an image file of `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(HfsError::ReadOnly);
        }
        check_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset.0)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

/// One observable device operation, recorded by [`MemoryByteDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Write { offset: u64, len: usize },
    /// A write accepted but discarded because the write budget ran out.
    DroppedWrite { offset: u64, len: usize },
    Sync,
    Trim { offset: u64, len: u64 },
}

#[derive(Debug)]
struct MemoryState {
    bytes: Vec<u8>,
    /// Writes still allowed to land; `None` is unlimited.
    write_budget: Option<usize>,
    fail_reads: bool,
    fail_writes: bool,
    events: Vec<DeviceEvent>,
}

/// In-memory device for tests and tooling.
///
/// Clones share the same backing bytes. A write budget simulates a crash:
/// once exhausted, writes report success but never reach the bytes.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                bytes,
                write_budget: None,
                fail_reads: false,
                fail_writes: false,
                events: Vec::new(),
            })),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().bytes.clone()
    }

    /// Allow `writes` more writes to land, then silently drop the rest.
    pub fn set_write_budget(&self, writes: Option<usize>) {
        self.state.lock().write_budget = writes;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Recorded writes, syncs and trims since creation or the last call.
    pub fn take_events(&self) -> Vec<DeviceEvent> {
        std::mem::take(&mut self.state.lock().events)
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.state.lock().bytes.len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        if state.fail_reads {
            return Err(HfsError::Io(io::Error::other("injected read failure")));
        }
        let dev_len = u64::try_from(state.bytes.len()).unwrap_or(0);
        check_range(offset, buf.len(), dev_len, "read")?;
        let start = usize::try_from(offset.0)
            .map_err(|_| HfsError::Format("offset overflow".to_owned()))?;
        buf.copy_from_slice(&state.bytes[start..start + buf.len()]);
        drop(state);
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(HfsError::Io(io::Error::other("injected write failure")));
        }
        let dev_len = u64::try_from(state.bytes.len()).unwrap_or(0);
        check_range(offset, buf.len(), dev_len, "write")?;
        let event = match state.write_budget {
            Some(0) => DeviceEvent::DroppedWrite {
                offset: offset.0,
                len: buf.len(),
            },
            budget => {
                state.write_budget = budget.map(|b| b - 1);
                let start = usize::try_from(offset.0)
                    .map_err(|_| HfsError::Format("offset overflow".to_owned()))?;
                state.bytes[start..start + buf.len()].copy_from_slice(buf);
                DeviceEvent::Write {
                    offset: offset.0,
                    len: buf.len(),
                }
            }
        };
        state.events.push(event);
        drop(state);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.state.lock().events.push(DeviceEvent::Sync);
        Ok(())
    }

    fn trim(&self, extents: &[(ByteOffset, u64)]) -> Result<()> {
        let mut state = self.state.lock();
        for &(offset, len) in extents {
            state.events.push(DeviceEvent::Trim {
                offset: offset.0,
                len,
            });
        }
        drop(state);
        Ok(())
    }
}

/// Read the 512-byte region at offset 1024 from `base` (volume header or
/// HFS wrapper MDB).
pub fn read_header_region(
    dev: &dyn ByteDevice,
    base: u64,
) -> Result<[u8; VOLUME_HEADER_SIZE]> {
    let mut buf = [0_u8; VOLUME_HEADER_SIZE];
    let offset = base
        .checked_add(VOLUME_HEADER_OFFSET)
        .ok_or_else(|| HfsError::Format("header offset overflows u64".to_owned()))?;
    dev.read_exact_at(ByteOffset(offset), &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_device_round_trips_and_bounds() {
        let dev = MemoryByteDevice::new(4096);
        dev.write_all_at(ByteOffset(100), &[9_u8; 8]).expect("write");
        let mut buf = [0_u8; 8];
        dev.read_exact_at(ByteOffset(100), &mut buf).expect("read");
        assert_eq!(buf, [9_u8; 8]);

        let err = dev
            .read_exact_at(ByteOffset(4090), &mut buf)
            .expect_err("oob");
        assert!(matches!(err, HfsError::Io(_)));
        assert_eq!(dev.block_count(), 8);
    }

    #[test]
    fn write_budget_drops_later_writes() {
        let dev = MemoryByteDevice::new(1024);
        dev.set_write_budget(Some(1));
        dev.write_all_at(ByteOffset(0), &[1_u8; 4]).expect("first");
        dev.write_all_at(ByteOffset(4), &[2_u8; 4]).expect("second reports ok");
        let bytes = dev.snapshot();
        assert_eq!(&bytes[0..4], &[1_u8; 4]);
        assert_eq!(&bytes[4..8], &[0_u8; 4]);
        let events = dev.take_events();
        assert!(matches!(events[1], DeviceEvent::DroppedWrite { offset: 4, .. }));
    }

    #[test]
    fn injected_failures_surface_as_io() {
        let dev = MemoryByteDevice::new(1024);
        dev.set_fail_writes(true);
        assert!(matches!(
            dev.write_all_at(ByteOffset(0), &[0]),
            Err(HfsError::Io(_))
        ));
        dev.set_fail_reads(true);
        let mut buf = [0_u8; 1];
        assert!(dev.read_exact_at(ByteOffset(0), &mut buf).is_err());
    }

    #[test]
    fn file_device_reads_back_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image.hfs");
        let dev = FileByteDevice::create(&path, 8192).expect("create");
        dev.write_all_at(ByteOffset(1024), b"H+").expect("write");
        dev.sync().expect("sync");

        let reopened = FileByteDevice::open(&path).expect("open");
        assert!(reopened.is_writable());
        let region = read_header_region(&reopened, 0).expect("region");
        assert_eq!(&region[0..2], b"H+");
    }

    #[test]
    fn cache_error_conversion_keeps_classes() {
        let io = BlockCacheError::Unavailable {
            file: FileId::CATALOG,
            block: 3,
            source: HfsError::Io(io::Error::other("eio")),
        };
        assert!(matches!(HfsError::from(io), HfsError::Io(_)));

        let mismatch = BlockCacheError::SizeMismatch {
            file: FileId::CATALOG,
            block: 3,
            cached: 512,
            requested: 4096,
        };
        assert!(HfsError::from(mismatch).is_corruption());

        let pinned = BlockCacheError::NotPinned {
            file: FileId::EXTENTS,
            block: 1,
        };
        assert!(HfsError::from(pinned).is_invariant_violation());
    }
}
