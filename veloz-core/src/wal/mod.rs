//! Write-ahead log: the append-only, crash-durable record that is ground
//! truth for state recovery.
//!
//! Frame format: `[u32 length][u8 type][u64 sequence][i64 timestamp_ns][bytes
//! payload][u32 crc32c]`, where `length` covers the `type` + `sequence` +
//! `timestamp_ns` + `payload` bytes (not itself nor the trailing checksum).
//! `crc32fast` computes the checksum over that same span, the teacher's
//! checked-arithmetic discipline from `core::errors` applied to on-disk
//! framing instead of in-memory numerics. A segment open for append is a
//! single `File` kept inside the `Wal`, mirroring the one-writer-thread
//! ownership of `execution::journal::AsyncJournal`.

pub mod replication;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalEntryType {
    OrderAccepted = 1,
    OrderRejected = 2,
    OrderCanceled = 3,
    Fill = 4,
    BalanceUpdate = 5,
    Checkpoint = 6,
}

impl WalEntryType {
    fn from_u8(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => Self::OrderAccepted,
            2 => Self::OrderRejected,
            3 => Self::OrderCanceled,
            4 => Self::Fill,
            5 => Self::BalanceUpdate,
            6 => Self::Checkpoint,
            other => bail!("unknown WAL entry type tag {other}"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WalEntry {
    pub sequence: u64,
    pub entry_type: WalEntryType,
    pub timestamp_ns: i64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncMode {
    Every,
    Interval,
    Off,
}

/// Append-only log with a dense, strictly monotonic sequence counter
/// starting at 1. Durability: under `Every`, `append` does not return until
/// the frame is fsynced; under `Interval`/`Off` the caller accepts a bounded
/// durability window in exchange for throughput.
pub struct Wal {
    file: File,
    path: PathBuf,
    next_sequence: AtomicU64,
    fsync_mode: FsyncMode,
    bytes_written: u64,
    segment_bytes: u64,
}

impl Wal {
    /// Open (creating if absent) and recover the last sequence number by
    /// scanning existing frames. A partially-written trailing frame is
    /// truncated away rather than rejected.
    pub fn open(path: impl AsRef<Path>, fsync_mode: FsyncMode, segment_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (last_sequence, valid_len) = Self::scan_for_recovery(&path)?;
        if let Ok(metadata) = std::fs::metadata(&path) {
            if metadata.len() > valid_len {
                warn!(
                    path = %path.display(),
                    discarded_bytes = metadata.len() - valid_len,
                    "truncating incomplete trailing WAL record"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(valid_len)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening WAL file {}", path.display()))?;

        Ok(Self {
            file,
            path,
            next_sequence: AtomicU64::new(last_sequence + 1),
            fsync_mode,
            bytes_written: valid_len,
            segment_bytes,
        })
    }

    fn scan_for_recovery(path: &Path) -> Result<(u64, u64)> {
        let Ok(file) = File::open(path) else {
            return Ok((0, 0));
        };
        let mut reader = BufReader::new(file);
        let mut last_sequence = 0u64;
        let mut valid_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let body_len = u32::from_le_bytes(len_buf) as usize;
            let mut body = vec![0u8; body_len];
            let mut crc_buf = [0u8; 4];
            if reader.read_exact(&mut body).is_err() || reader.read_exact(&mut crc_buf).is_err() {
                break; // truncated trailing record
            }
            let expected_crc = u32::from_le_bytes(crc_buf);
            let actual_crc = crc32fast::hash(&body);
            if actual_crc != expected_crc {
                warn!("WAL record checksum mismatch at offset {valid_len}; stopping replay scan");
                break;
            }
            if body.len() < 1 + 8 + 8 {
                break;
            }
            let sequence = u64::from_le_bytes(body[1..9].try_into().unwrap());
            last_sequence = sequence;
            valid_len += 4 + body_len as u64 + 4;
        }

        Ok((last_sequence, valid_len))
    }

    /// Append one entry, returning its assigned sequence number. Under
    /// `FsyncMode::Every`, durable before returning.
    pub fn append(&mut self, entry_type: WalEntryType, timestamp_ns: i64, payload: &[u8]) -> Result<u64> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);

        let mut body = Vec::with_capacity(1 + 8 + 8 + payload.len());
        body.push(entry_type as u8);
        body.extend_from_slice(&sequence.to_le_bytes());
        body.extend_from_slice(&timestamp_ns.to_le_bytes());
        body.extend_from_slice(payload);

        let crc = crc32fast::hash(&body);
        let mut frame = Vec::with_capacity(4 + body.len() + 4);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&crc.to_le_bytes());

        self.file.write_all(&frame).context("writing WAL frame")?;
        if self.fsync_mode == FsyncMode::Every {
            self.file.sync_data().context("fsyncing WAL frame")?;
        }
        self.bytes_written += frame.len() as u64;

        Ok(sequence)
    }

    pub fn fsync(&mut self) -> Result<()> {
        self.file.sync_data().context("fsyncing WAL")
    }

    pub fn should_rotate(&self) -> bool {
        self.bytes_written >= self.segment_bytes
    }

    pub fn last_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst) - 1
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay all durable entries from the file into `apply`, in order.
    /// Idempotent: callers must be able to re-apply the same suffix to the
    /// same initial state and reach the same final state.
    pub fn replay(path: impl AsRef<Path>, mut apply: impl FnMut(WalEntry) -> Result<()>) -> Result<()> {
        let path = path.as_ref();
        let Ok(file) = File::open(path) else {
            return Ok(());
        };
        let mut reader = BufReader::new(file);

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let body_len = u32::from_le_bytes(len_buf) as usize;
            let mut body = vec![0u8; body_len];
            let mut crc_buf = [0u8; 4];
            if reader.read_exact(&mut body).is_err() || reader.read_exact(&mut crc_buf).is_err() {
                warn!("truncated trailing WAL record during replay; stopping");
                break;
            }
            let expected_crc = u32::from_le_bytes(crc_buf);
            if crc32fast::hash(&body) != expected_crc {
                error!("WAL checksum mismatch during replay; stopping replay at this record");
                break;
            }

            let entry_type = WalEntryType::from_u8(body[0])?;
            let sequence = u64::from_le_bytes(body[1..9].try_into().unwrap());
            let timestamp_ns = i64::from_le_bytes(body[9..17].try_into().unwrap());
            let payload = body[17..].to_vec();

            apply(WalEntry {
                sequence,
                entry_type,
                timestamp_ns,
                payload,
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn append_then_replay_reproduces_entries() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();

        {
            let mut wal = Wal::open(&path, FsyncMode::Every, u64::MAX).unwrap();
            let s1 = wal.append(WalEntryType::OrderAccepted, 1, b"a1").unwrap();
            let s2 = wal.append(WalEntryType::Fill, 2, b"f1").unwrap();
            assert_eq!(s1, 1);
            assert_eq!(s2, 2);
        }

        let mut seen = Vec::new();
        Wal::replay(&path, |entry| {
            seen.push((entry.sequence, entry.entry_type));
            Ok(())
        })
        .unwrap();

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 1);
        assert_eq!(seen[1].1, WalEntryType::Fill);
    }

    #[test]
    fn sequence_resumes_after_reopen() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();

        {
            let mut wal = Wal::open(&path, FsyncMode::Every, u64::MAX).unwrap();
            wal.append(WalEntryType::OrderAccepted, 1, b"a1").unwrap();
        }
        let mut wal = Wal::open(&path, FsyncMode::Every, u64::MAX).unwrap();
        let next = wal.append(WalEntryType::Fill, 2, b"f1").unwrap();
        assert_eq!(next, 2);
    }

    #[test]
    fn truncated_trailing_record_is_tolerated_on_open() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        {
            let mut wal = Wal::open(&path, FsyncMode::Every, u64::MAX).unwrap();
            wal.append(WalEntryType::OrderAccepted, 1, b"a1").unwrap();
        }
        // Corrupt: append a partial frame header only.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
        }

        let wal = Wal::open(&path, FsyncMode::Every, u64::MAX).unwrap();
        assert_eq!(wal.last_sequence(), 1);
    }

    #[test]
    fn checksum_mismatch_stops_replay_without_erroring() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        {
            let mut wal = Wal::open(&path, FsyncMode::Every, u64::MAX).unwrap();
            wal.append(WalEntryType::OrderAccepted, 1, b"a1").unwrap();
        }
        // Flip a byte inside the payload to break the CRC.
        {
            let mut bytes = std::fs::read(&path).unwrap();
            let last = bytes.len() - 5;
            bytes[last] ^= 0xFF;
            std::fs::write(&path, bytes).unwrap();
        }
        let mut seen = 0;
        Wal::replay(&path, |_| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 0);
    }
}
