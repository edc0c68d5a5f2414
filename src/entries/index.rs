//! Ordered in-memory index over the entry log.

use crate::error::Result;
use crate::types::{EntryKey, Timestamp, Versionstamp};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Where a live entry's `Put` frame sits and which versionstamp it carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub versionstamp: Versionstamp,
    pub offset: u64,
    pub created: Timestamp,
}

/// Index mapping live keys to log offsets, kept in key order.
#[derive(Default)]
pub struct EntryIndex {
    entries: RwLock<BTreeMap<EntryKey, IndexEntry>>,
}

impl EntryIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a key. Returns the previous entry, if any.
    pub fn insert(&self, key: EntryKey, entry: IndexEntry) -> Option<IndexEntry> {
        self.entries.write().insert(key, entry)
    }

    /// Remove a key. Returns the removed entry, if any.
    pub fn remove(&self, key: &EntryKey) -> Option<IndexEntry> {
        self.entries.write().remove(key)
    }

    /// Look up a key.
    pub fn get(&self, key: &EntryKey) -> Option<IndexEntry> {
        self.entries.read().get(key).copied()
    }

    /// Number of live entries.
    pub fn count(&self) -> usize {
        self.entries.read().len()
    }

    /// Visit every key in `namespace` in order while holding the read lock.
    ///
    /// Writers are excluded for the duration, so the visit sees one snapshot.
    pub fn scan<F>(&self, namespace: &str, mut visit: F) -> Result<()>
    where
        F: FnMut(&EntryKey, &IndexEntry) -> Result<()>,
    {
        let entries = self.entries.read();
        let range = EntryKey::namespace_start(namespace)..=EntryKey::namespace_end(namespace);
        for (key, entry) in entries.range(range) {
            visit(key, entry)?;
        }
        Ok(())
    }

    /// Run `rewrite` with exclusive access to the whole map.
    pub fn rewrite_with<F>(&self, rewrite: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<EntryKey, IndexEntry>) -> Result<()>,
    {
        let mut entries = self.entries.write();
        rewrite(&mut entries)
    }
}
