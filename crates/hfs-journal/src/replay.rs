//! Mount-time journal replay.
//!
//! Transactions between the header's `start` and `end` were committed and
//! recorded at the last checkpoint; any of them failing validation means the
//! journal is corrupt. Commits after `end` were made durable without the
//! header being rewritten; they are replayed for as long as each carries a
//! valid block list, payload, commit block and the next sequence number.

use crate::JournalError;
use crate::format::{BlockList, ByteOrder, COMMIT_LEN, CommitRecord, JournalHeader, RecordError, pad_to};
use crate::ring::Ring;
use hfs_types::ByteOffset;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    /// Transactions written to their home locations.
    pub transactions: usize,
    /// Of those, transactions found after the header's `end`.
    pub past_end: usize,
    pub blocks: usize,
    /// The journal was written in the opposite byte order.
    pub swapped: bool,
}

#[derive(Debug)]
pub(crate) struct ReplayOutcome {
    pub(crate) report: ReplayReport,
    pub(crate) end: u64,
    pub(crate) next_sequence: u32,
}

#[derive(Debug)]
struct DecodedTxn {
    len: u64,
    blocks: Vec<(u64, Vec<u8>)>,
}

enum Scan {
    Txn(DecodedTxn),
    Invalid(RecordError),
}

fn read_transaction(
    ring: &Ring,
    pos: u64,
    order: ByteOrder,
    expected: u32,
) -> Result<Scan, JournalError> {
    let bs = ring.block_size();
    let first = ring.read(pos, bs)?;
    let count = match BlockList::peek_count(&first, order) {
        Ok(count) => count,
        Err(err) => return Ok(Scan::Invalid(err)),
    };
    let list_len = BlockList::encoded_len(count, bs);
    if list_len > ring.max_record_len() {
        return Ok(Scan::Invalid(RecordError::Length("block list larger than ring")));
    }
    let list_bytes = if list_len > bs {
        ring.read(pos, list_len)?
    } else {
        first
    };
    let list = match BlockList::decode(&list_bytes, order) {
        Ok(list) => list,
        Err(err) => return Ok(Scan::Invalid(err)),
    };
    if list.sequence != expected {
        return Ok(Scan::Invalid(RecordError::Sequence {
            expected,
            found: list.sequence,
        }));
    }
    let commit_len = pad_to(COMMIT_LEN as u64, bs);
    if list.bytes_used > ring.max_record_len() || list.bytes_used % bs != 0 {
        return Ok(Scan::Invalid(RecordError::Length("bytes_used")));
    }

    let mut crc = crc32c::crc32c(&list_bytes);
    let mut consumed = list_len;
    let mut cursor = ring.advance(pos, list_len);
    let mut blocks = Vec::with_capacity(list.blocks.len());
    for info in &list.blocks {
        let padded = pad_to(u64::from(info.len), bs);
        consumed += padded;
        if consumed + commit_len > list.bytes_used {
            return Ok(Scan::Invalid(RecordError::Length("payload past bytes_used")));
        }
        let raw = ring.read(cursor, padded)?;
        crc = crc32c::crc32c_append(crc, &raw);
        let len = usize::try_from(info.len).map_err(|_| {
            JournalError::Geometry(format!("payload length {} too large", info.len))
        })?;
        blocks.push((info.dev_offset, raw[..len].to_vec()));
        cursor = ring.advance(cursor, padded);
    }
    if consumed + commit_len != list.bytes_used {
        return Ok(Scan::Invalid(RecordError::Length("bytes_used mismatch")));
    }

    let commit = match CommitRecord::decode(&ring.read(cursor, commit_len)?, order) {
        Ok(commit) => commit,
        Err(err) => return Ok(Scan::Invalid(err)),
    };
    if commit.sequence != list.sequence {
        return Ok(Scan::Invalid(RecordError::Sequence {
            expected: list.sequence,
            found: commit.sequence,
        }));
    }
    if commit.bytes_used != list.bytes_used || commit.num_blocks as usize != list.blocks.len() {
        return Ok(Scan::Invalid(RecordError::Length("commit disagrees with block list")));
    }
    if commit.data_checksum != crc {
        return Ok(Scan::Invalid(RecordError::Checksum {
            what: "transaction payload",
        }));
    }
    Ok(Scan::Txn(DecodedTxn {
        len: list.bytes_used,
        blocks,
    }))
}

/// Replay every committed transaction and return where the log now ends.
pub(crate) fn replay(
    ring: &Ring,
    header: &JournalHeader,
    order: ByteOrder,
) -> Result<ReplayOutcome, JournalError> {
    let mut pos = header.start;
    let mut sequence = header.sequence;
    let mut txns = Vec::new();

    while pos != header.end {
        match read_transaction(ring, pos, order, sequence)? {
            Scan::Txn(txn) if txn.len <= ring.distance(pos, header.end) => {
                trace!(target: "hfs::journal", pos, sequence, len = txn.len, "journal_replay_scan");
                pos = ring.advance(pos, txn.len);
                sequence = sequence.wrapping_add(1);
                txns.push(txn);
            }
            Scan::Txn(txn) => {
                error!(target: "hfs::journal", pos, sequence, len = txn.len, end = header.end, "journal_replay_record_crosses_end");
                return Err(JournalError::Corrupt {
                    offset: pos,
                    detail: "transaction crosses recorded end".into(),
                });
            }
            Scan::Invalid(err) => {
                error!(target: "hfs::journal", pos, sequence, %err, "journal_replay_corrupt");
                return Err(JournalError::Corrupt {
                    offset: pos,
                    detail: err.to_string(),
                });
            }
        }
    }

    let committed = txns.len();
    loop {
        match read_transaction(ring, pos, order, sequence)? {
            Scan::Txn(txn) if txn.len <= ring.free(header.start, pos) => {
                debug!(target: "hfs::journal", pos, sequence, len = txn.len, "journal_replay_past_end");
                pos = ring.advance(pos, txn.len);
                sequence = sequence.wrapping_add(1);
                txns.push(txn);
            }
            Scan::Txn(_) => break,
            Scan::Invalid(err) => {
                trace!(target: "hfs::journal", pos, %err, "journal_replay_stop");
                break;
            }
        }
    }

    let device_blocks: usize = txns.iter().map(|t| t.blocks.len()).sum();
    for txn in &txns {
        for (dev_offset, data) in &txn.blocks {
            ring.device_write(ByteOffset(*dev_offset), data)?;
        }
    }
    if !txns.is_empty() {
        ring.sync()?;
    }

    let report = ReplayReport {
        transactions: txns.len(),
        past_end: txns.len() - committed,
        blocks: device_blocks,
        swapped: order == ByteOrder::Little,
    };
    if report.transactions > 0 {
        info!(
            target: "hfs::journal",
            transactions = report.transactions,
            past_end = report.past_end,
            blocks = report.blocks,
            swapped = report.swapped,
            "journal_replay"
        );
    }
    Ok(ReplayOutcome {
        report,
        end: pos,
        next_sequence: sequence,
    })
}
