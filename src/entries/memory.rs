//! In-memory entry store.

use super::EntryStore;
use crate::error::{RelayError, Result};
use crate::types::{CommitOutcome, Entry, EntryKey, Versionstamp};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<EntryKey, (Versionstamp, Vec<u8>)>,
    last_versionstamp: Versionstamp,
}

/// Process-local [`EntryStore`].
///
/// Every operation runs under one mutex, which makes the conditional delete
/// linearizable. Nothing survives the process.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability. While unavailable every operation fails with
    /// `StoreUnavailable` and nothing is mutated.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live entries across all namespaces.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RelayError::StoreUnavailable("memory store offline".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryStore for MemoryStore {
    fn put(&self, key: &EntryKey, value: &[u8]) -> Result<Versionstamp> {
        self.check_available()?;
        let mut state = self.state.lock();
        let versionstamp = state.last_versionstamp.next();
        state.last_versionstamp = versionstamp;
        state
            .entries
            .insert(key.clone(), (versionstamp, value.to_vec()));
        Ok(versionstamp)
    }

    fn list_ordered(&self, namespace: &str) -> Result<Vec<Entry>> {
        self.check_available()?;
        let state = self.state.lock();
        let range = EntryKey::namespace_start(namespace)..=EntryKey::namespace_end(namespace);
        Ok(state
            .entries
            .range(range)
            .map(|(key, (versionstamp, value))| Entry {
                key: key.clone(),
                value: value.clone(),
                versionstamp: *versionstamp,
            })
            .collect())
    }

    fn compare_and_delete(&self, key: &EntryKey, expected: Versionstamp) -> Result<CommitOutcome> {
        self.check_available()?;
        let mut state = self.state.lock();
        match state.entries.get(key) {
            Some((current, _)) if *current == expected => {}
            _ => return Ok(CommitOutcome::Conflict),
        }
        state.entries.remove(key);
        state.last_versionstamp = state.last_versionstamp.next();
        Ok(CommitOutcome::Committed)
    }
}
