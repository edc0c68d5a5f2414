//! Durable entry store tying the log and index together.

use crate::entries::{EntryIndex, EntryLog, EntryStore, IndexEntry, LogOp};
use crate::error::{RelayError, Result};
use crate::types::{CommitOutcome, Entry, EntryKey, StoreStats, Timestamp, Versionstamp};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Sync the log every N commits (1 = every commit).
    pub sync_interval: u64,

    /// Value cache size (number of entries).
    pub value_cache_size: usize,

    /// Compact automatically once this many dead frames pile up (0 = never).
    pub compaction_threshold: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./courier-store"),
            create_if_missing: true,
            sync_interval: EntryLog::DEFAULT_SYNC_INTERVAL,
            value_cache_size: 1000,
            compaction_threshold: 10_000,
        }
    }
}

/// Outcome of a log compaction.
#[derive(Clone, Debug)]
pub struct CompactionSummary {
    /// Entries carried over.
    pub live_entries: usize,
    /// Dead frames dropped.
    pub dropped_frames: u64,
    /// Log size before compaction.
    pub bytes_before: u64,
    /// Log size after compaction.
    pub bytes_after: u64,
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"CRS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Name of the entry log inside the store directory.
const LOG_FILE: &str = "entries.log";

/// Mutation bookkeeping, guarded by the write lock.
struct WriteState {
    last_versionstamp: Versionstamp,
    dead_frames: u64,
}

/// The on-disk [`EntryStore`].
///
/// Every mutation is appended to the entry log before the in-memory index
/// changes. Mutations are serialized by a single write lock, which is what
/// makes `compare_and_delete` linearizable.
pub struct DurableStore {
    /// Store configuration.
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Entry log.
    log: EntryLog,

    /// Live keys in order.
    index: EntryIndex,

    /// Recently written values.
    cache: Mutex<LruCache<EntryKey, Vec<u8>>>,

    /// Lock for write operations to ensure atomicity.
    writer: Mutex<WriteState>,
}

impl DurableStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(RelayError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let log = EntryLog::open_with_sync_interval(config.path.join(LOG_FILE), config.sync_interval)?;
        info!(path = %config.path.display(), "created entry store");

        Self::assemble(config, lock_file, log)
    }

    /// Open an existing store, replaying the log into the index.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let log = EntryLog::open_with_sync_interval(config.path.join(LOG_FILE), config.sync_interval)?;
        let store = Self::assemble(config, lock_file, log)?;

        let stats = store.stats();
        info!(
            path = %store.config.path.display(),
            live_entries = stats.live_entries,
            dead_frames = stats.dead_frames,
            "opened entry store"
        );
        Ok(store)
    }

    fn assemble(config: StoreConfig, lock_file: File, log: EntryLog) -> Result<Self> {
        let index = EntryIndex::new();
        let mut state = WriteState {
            last_versionstamp: Versionstamp::default(),
            dead_frames: 0,
        };

        for (offset, op) in log.replay()? {
            state.last_versionstamp = state.last_versionstamp.max(op.versionstamp());
            match op {
                LogOp::Put {
                    key,
                    versionstamp,
                    created,
                    ..
                } => {
                    let entry = IndexEntry {
                        versionstamp,
                        offset,
                        created,
                    };
                    if index.insert(key, entry).is_some() {
                        state.dead_frames += 1;
                    }
                }
                LogOp::Delete { key, .. } => {
                    state.dead_frames += if index.remove(&key).is_some() { 2 } else { 1 };
                }
                LogOp::Checkpoint { .. } => {}
            }
        }

        let cache_size = NonZeroUsize::new(config.value_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            index,
            cache: Mutex::new(LruCache::new(cache_size)),
            writer: Mutex::new(state),
        })
    }

    /// Rewrite the log with only live entries.
    pub fn compact(&self) -> Result<CompactionSummary> {
        let mut state = self.writer.lock();
        self.compact_locked(&mut state)
    }

    fn compact_locked(&self, state: &mut WriteState) -> Result<CompactionSummary> {
        let bytes_before = self.log.size();
        let dropped_frames = state.dead_frames;
        let mut live_entries = 0;

        self.index.rewrite_with(|entries| {
            let mut ops = Vec::with_capacity(entries.len() + 1);
            ops.push(LogOp::Checkpoint {
                versionstamp: state.last_versionstamp,
            });
            for (key, meta) in entries.iter() {
                ops.push(LogOp::Put {
                    key: key.clone(),
                    value: self.read_value(key, meta)?,
                    versionstamp: meta.versionstamp,
                    created: meta.created,
                });
            }

            let offsets = self.log.rewrite(&ops)?;
            for (meta, offset) in entries.values_mut().zip(offsets.into_iter().skip(1)) {
                meta.offset = offset;
            }
            live_entries = entries.len();
            Ok(())
        })?;

        state.dead_frames = 0;
        let summary = CompactionSummary {
            live_entries,
            dropped_frames,
            bytes_before,
            bytes_after: self.log.size(),
        };
        debug!(?summary, "compacted entry store");
        Ok(summary)
    }

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        let state = self.writer.lock();
        StoreStats {
            live_entries: self.index.count() as u64,
            dead_frames: state.dead_frames,
            log_size_bytes: self.log.size(),
            last_versionstamp: state.last_versionstamp,
        }
    }

    /// Sync all data to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Entry Operations ---

    fn put_entry(&self, key: &EntryKey, value: &[u8]) -> Result<Versionstamp> {
        let mut state = self.writer.lock();

        let versionstamp = state.last_versionstamp.next();
        let created = Timestamp::now();
        let offset = self.log.append(&LogOp::Put {
            key: key.clone(),
            value: value.to_vec(),
            versionstamp,
            created,
        })?;

        let entry = IndexEntry {
            versionstamp,
            offset,
            created,
        };
        if self.index.insert(key.clone(), entry).is_some() {
            state.dead_frames += 1;
        }
        state.last_versionstamp = versionstamp;
        self.cache.lock().put(key.clone(), value.to_vec());

        Ok(versionstamp)
    }

    fn list_entries(&self, namespace: &str) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        self.index.scan(namespace, |key, meta| {
            entries.push(Entry {
                key: key.clone(),
                value: self.read_value(key, meta)?,
                versionstamp: meta.versionstamp,
            });
            Ok(())
        })?;
        Ok(entries)
    }

    fn delete_if_current(&self, key: &EntryKey, expected: Versionstamp) -> Result<CommitOutcome> {
        let mut state = self.writer.lock();

        match self.index.get(key) {
            Some(meta) if meta.versionstamp == expected => {}
            _ => return Ok(CommitOutcome::Conflict),
        }

        let versionstamp = state.last_versionstamp.next();
        self.log.append(&LogOp::Delete {
            key: key.clone(),
            versionstamp,
        })?;
        self.index.remove(key);
        self.cache.lock().pop(key);
        state.last_versionstamp = versionstamp;
        state.dead_frames += 2;

        let threshold = self.config.compaction_threshold;
        if threshold > 0 && state.dead_frames >= threshold {
            // The delete is already durable; a failed compaction must not undo it.
            if let Err(e) = self.compact_locked(&mut state) {
                warn!(error = %e, "automatic compaction failed");
            }
        }

        Ok(CommitOutcome::Committed)
    }

    fn read_value(&self, key: &EntryKey, meta: &IndexEntry) -> Result<Vec<u8>> {
        if let Some(value) = self.cache.lock().get(key) {
            return Ok(value.clone());
        }

        match self.log.read_at(meta.offset)? {
            LogOp::Put {
                key: stored,
                value,
                versionstamp,
                ..
            } if &stored == key && versionstamp == meta.versionstamp => Ok(value),
            other => Err(RelayError::Corruption(format!(
                "index points {} at {:?}",
                key, other
            ))),
        }
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(RelayError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(RelayError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| RelayError::Locked)?;

        Ok(lock_file)
    }
}

impl EntryStore for DurableStore {
    fn put(&self, key: &EntryKey, value: &[u8]) -> Result<Versionstamp> {
        self.put_entry(key, value).map_err(RelayError::unavailable)
    }

    fn list_ordered(&self, namespace: &str) -> Result<Vec<Entry>> {
        self.list_entries(namespace).map_err(RelayError::unavailable)
    }

    fn compare_and_delete(&self, key: &EntryKey, expected: Versionstamp) -> Result<CommitOutcome> {
        self.delete_if_current(key, expected)
            .map_err(RelayError::unavailable)
    }
}

impl Drop for DurableStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}
