//! Append-only, checksummed entry log.
//!
//! Layout: a 5-byte header (magic + version) followed by frames of
//! `[u32 len][MessagePack op][u32 crc32]`. Offsets handed out by
//! [`EntryLog::append`] point at the start of a frame.

use crate::error::{RelayError, Result};
use crate::types::{EntryKey, Timestamp, Versionstamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for the entry log.
const LOG_MAGIC: &[u8; 4] = b"CRL\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Header size (magic + version).
const HEADER_SIZE: u64 = 5;

/// Upper bound on a single frame body.
const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Operations recorded in the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    /// A write of `value` under `key`.
    Put {
        key: EntryKey,
        value: Vec<u8>,
        versionstamp: Versionstamp,
        created: Timestamp,
    },
    /// A successful conditional delete.
    Delete {
        key: EntryKey,
        versionstamp: Versionstamp,
    },
    /// Versionstamp high-water mark, written at the head of a compacted log.
    Checkpoint { versionstamp: Versionstamp },
}

impl LogOp {
    pub fn versionstamp(&self) -> Versionstamp {
        match self {
            LogOp::Put { versionstamp, .. }
            | LogOp::Delete { versionstamp, .. }
            | LogOp::Checkpoint { versionstamp } => *versionstamp,
        }
    }
}

struct LogFile {
    file: File,
    size: u64,
    writes_since_sync: u64,
}

/// Append-only entry log.
pub struct EntryLog {
    /// Path to the log file.
    path: PathBuf,

    /// File handle plus append position.
    inner: Mutex<LogFile>,

    /// Sync every N appends.
    sync_interval: u64,
}

impl EntryLog {
    /// Sync on every append, so a returned offset is durable.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 1;

    /// Open or create a log that syncs every append.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a log with a custom sync interval.
    /// - sync_interval = 0 or 1: sync every append
    /// - sync_interval = 100: sync every 100 appends
    ///
    /// A torn or corrupt tail is truncated back to the last intact frame.
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let size = if len < HEADER_SIZE {
            // Fresh file, or a crash before the header landed.
            file.set_len(0)?;
            Self::write_header(&mut file)?;
            HEADER_SIZE
        } else {
            Self::verify_header(&mut file)?;
            let valid_end = Self::find_valid_end(&mut file, len)?;
            if valid_end < len {
                warn!(
                    path = %path.display(),
                    valid_end,
                    file_len = len,
                    "truncating damaged tail of entry log"
                );
                file.set_len(valid_end)?;
                file.sync_all()?;
            }
            valid_end
        };

        Ok(Self {
            path,
            inner: Mutex::new(LogFile {
                file,
                size,
                writes_since_sync: 0,
            }),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Append an operation. Returns the frame offset.
    pub fn append(&self, op: &LogOp) -> Result<u64> {
        let frame = Self::encode_frame(op)?;

        let mut guard = self.inner.lock();
        let log = &mut *guard;
        let offset = log.size;
        let sync_due = log.writes_since_sync + 1 >= self.sync_interval;

        commit_frame(&mut log.file, offset, &frame, sync_due)?;
        log.size = offset + frame.len() as u64;
        log.writes_since_sync = if sync_due { 0 } else { log.writes_since_sync + 1 };

        Ok(offset)
    }

    /// Read the operation at a frame offset.
    pub fn read_at(&self, offset: u64) -> Result<LogOp> {
        let mut log = self.inner.lock();
        if offset < HEADER_SIZE || offset >= log.size {
            return Err(RelayError::Corruption(format!(
                "offset {} outside entry log (size {})",
                offset, log.size
            )));
        }
        log.file.seek(SeekFrom::Start(offset))?;
        let (op, _) = Self::read_frame(&mut log.file)?;
        Ok(op)
    }

    /// Every operation in the log with its offset, oldest first.
    pub fn replay(&self) -> Result<Vec<(u64, LogOp)>> {
        let mut log = self.inner.lock();
        let end = log.size;
        log.file.seek(SeekFrom::Start(HEADER_SIZE))?;

        let mut reader = BufReader::new(&mut log.file);
        let mut ops = Vec::new();
        let mut offset = HEADER_SIZE;
        while offset < end {
            let (op, frame_len) = Self::read_frame(&mut reader)?;
            ops.push((offset, op));
            offset += frame_len;
        }
        Ok(ops)
    }

    /// Replace the log with `ops`, atomically.
    ///
    /// Returns the new offset of each op, in order.
    pub fn rewrite(&self, ops: &[LogOp]) -> Result<Vec<u64>> {
        let tmp_path = self.path.with_extension("compact");

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        Self::write_header(&mut file)?;

        let mut offsets = Vec::with_capacity(ops.len());
        let mut size = HEADER_SIZE;
        {
            let mut writer = BufWriter::new(&mut file);
            for op in ops {
                let frame = Self::encode_frame(op)?;
                offsets.push(size);
                writer.write_all(&frame)?;
                size += frame.len() as u64;
            }
            writer.flush()?;
        }
        file.sync_all()?;

        let mut log = self.inner.lock();
        fs::rename(&tmp_path, &self.path)?;
        log.file = file;
        log.size = size;
        log.writes_since_sync = 0;

        debug!(path = %self.path.display(), frames = ops.len(), size, "rewrote entry log");
        Ok(offsets)
    }

    /// Force sync all pending appends to disk.
    pub fn sync(&self) -> Result<()> {
        let mut log = self.inner.lock();
        log.file.sync_all()?;
        log.writes_since_sync = 0;
        Ok(())
    }

    /// Current file size.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    fn write_header(file: &mut File) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(LOG_MAGIC)?;
        file.write_all(&[LOG_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_header(file: &mut File) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(RelayError::InvalidFormat("Invalid entry log magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(RelayError::InvalidFormat(format!(
                "Unsupported entry log version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    /// Offset just past the last intact frame.
    ///
    /// Only the final frame may be damaged. A bad frame with data after it
    /// is corruption: dropping the rest would lose later puts and deletes.
    fn find_valid_end(file: &mut File, len: u64) -> Result<u64> {
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut reader = BufReader::new(file);

        let mut offset = HEADER_SIZE;
        while offset < len {
            match Self::read_frame(&mut reader) {
                Ok((_, frame_len)) => offset += frame_len,
                Err(e) => {
                    if !Self::frame_reaches_end(reader.get_mut(), offset, len)? {
                        return Err(RelayError::Corruption(format!(
                            "damaged frame at offset {} is followed by more data: {}",
                            offset, e
                        )));
                    }
                    debug!(offset, error = %e, "entry log scan stopped at damaged tail");
                    break;
                }
            }
        }
        Ok(offset.min(len))
    }

    /// Whether the frame starting at `offset` claims to run to or past `len`.
    fn frame_reaches_end(file: &mut File, offset: u64, len: u64) -> Result<bool> {
        if len - offset < 4 {
            return Ok(true);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let frame_end = offset + 8 + u32::from_le_bytes(len_bytes) as u64;
        Ok(frame_end >= len)
    }

    fn encode_frame(op: &LogOp) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec(op)?;
        if encoded.len() > MAX_FRAME_SIZE {
            return Err(RelayError::Serialization(format!(
                "entry frame of {} bytes exceeds limit",
                encoded.len()
            )));
        }

        let mut frame = Vec::with_capacity(encoded.len() + 8);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
        Ok(frame)
    }

    /// Read one frame. Returns the op and the frame's total length.
    fn read_frame<R: Read>(reader: &mut R) -> Result<(LogOp, u64)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(RelayError::Corruption("entry frame too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&encoded);

        if stored_checksum != computed_checksum {
            return Err(RelayError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let op = rmp_serde::from_slice(&encoded)?;
        Ok((op, 8 + len as u64))
    }
}

/// The file operations an append performs.
trait FrameSink {
    fn write_frame(&mut self, offset: u64, frame: &[u8]) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl FrameSink for File {
    fn write_frame(&mut self, offset: u64, frame: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(frame)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Write `frame` at `offset`, then sync if `sync` is set.
///
/// If either step fails the sink is cut back to `offset`, so a frame the
/// caller saw fail is never replayed.
fn commit_frame<S: FrameSink>(sink: &mut S, offset: u64, frame: &[u8], sync: bool) -> Result<()> {
    let written = sink
        .write_frame(offset, frame)
        .and_then(|()| if sync { sink.sync() } else { Ok(()) });

    if let Err(e) = written {
        if let Err(rollback) = sink.truncate(offset) {
            warn!(offset, error = %rollback, "failed to roll back entry log append");
        }
        return Err(e.into());
    }
    Ok(())
}
