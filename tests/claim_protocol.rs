//! Claim protocol tests: racing claimers, double observation, drain order.

use courier::{
    claim, ChannelTransport, ClaimOutcome, CommitOutcome, ConsumerSession, DurableStore, Entry,
    EntryKey, EntryStore, IdGenerator, MemoryStore, Notifier, SessionConfig, SessionId,
    SessionState, StoreConfig, Versionstamp,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn seed(store: &dyn EntryStore, count: usize) -> Vec<Entry> {
    let ids = IdGenerator::new();
    (0..count)
        .map(|i| {
            let key = EntryKey::message(ids.next_id());
            let value = format!("message {}", i).into_bytes();
            let versionstamp = store.put(&key, &value).unwrap();
            Entry {
                key,
                value,
                versionstamp,
            }
        })
        .collect()
}

/// Every claimer walks the same entries concurrently; returns what each delivered.
fn race(store: &dyn EntryStore, entries: &[Entry], claimers: usize) -> Vec<Vec<Vec<u8>>> {
    thread::scope(|scope| {
        let workers: Vec<_> = (0..claimers)
            .map(|offset| {
                scope.spawn(move || {
                    let (transport, receiver) = ChannelTransport::pair();
                    // Stagger start points so claimers collide mid-list.
                    for i in 0..entries.len() {
                        let entry = &entries[(i + offset) % entries.len()];
                        claim(store, entry, &transport).unwrap();
                    }
                    receiver.drain()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    })
}

fn assert_each_delivered_once(entries: &[Entry], delivered: &[Vec<Vec<u8>>]) {
    let all: Vec<&Vec<u8>> = delivered.iter().flatten().collect();
    assert_eq!(all.len(), entries.len());

    let unique: HashSet<&Vec<u8>> = all.iter().copied().collect();
    assert_eq!(unique.len(), entries.len());
    for entry in entries {
        assert!(unique.contains(&entry.value));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn racing_claims_deliver_each_entry_once(claimers in 2usize..8, count in 1usize..40) {
        let store = MemoryStore::new();
        let entries = seed(&store, count);

        let delivered = race(&store, &entries, claimers);

        assert_each_delivered_once(&entries, &delivered);
        prop_assert!(store.is_empty());
    }
}

#[test]
fn test_racing_claims_on_durable_store() {
    let dir = TempDir::new().unwrap();
    let store = DurableStore::create(StoreConfig {
        path: dir.path().join("store"),
        ..Default::default()
    })
    .unwrap();
    let entries = seed(&store, 50);

    let delivered = race(&store, &entries, 6);

    assert_each_delivered_once(&entries, &delivered);
    assert!(store.list_ordered("messages").unwrap().is_empty());
}

#[test]
fn test_stale_observation_loses() {
    let store = MemoryStore::new();
    let (transport, receiver) = ChannelTransport::pair();
    let entry = seed(&store, 1).remove(0);

    // Someone rewrote the entry after we observed it.
    store.put(&entry.key, b"rewritten").unwrap();

    assert_eq!(
        claim(&store, &entry, &transport).unwrap(),
        ClaimOutcome::AlreadyClaimed
    );
    assert!(receiver.drain().is_empty());
    assert_eq!(store.len(), 1);
}

#[test]
fn test_double_observation_is_idempotent() {
    let store = MemoryStore::new();
    let (transport, receiver) = ChannelTransport::pair();
    let entry = seed(&store, 1).remove(0);
    let echoed = entry.clone();

    let outcomes = [
        claim(&store, &entry, &transport).unwrap(),
        claim(&store, &echoed, &transport).unwrap(),
    ];

    assert_eq!(
        outcomes,
        [ClaimOutcome::Delivered, ClaimOutcome::AlreadyClaimed]
    );
    assert_eq!(receiver.drain().len(), 1);
}

/// Records every conditional delete and lets one key be "stolen" first.
struct RecordingStore {
    inner: MemoryStore,
    attempts: Mutex<Vec<EntryKey>>,
    stolen: Mutex<Option<EntryKey>>,
}

impl EntryStore for RecordingStore {
    fn put(&self, key: &EntryKey, value: &[u8]) -> courier::Result<Versionstamp> {
        self.inner.put(key, value)
    }

    fn list_ordered(&self, namespace: &str) -> courier::Result<Vec<Entry>> {
        self.inner.list_ordered(namespace)
    }

    fn compare_and_delete(
        &self,
        key: &EntryKey,
        expected: Versionstamp,
    ) -> courier::Result<CommitOutcome> {
        self.attempts.lock().push(key.clone());
        if self.stolen.lock().as_ref() == Some(key) {
            // Another consumer got there first.
            self.inner.compare_and_delete(key, expected)?;
        }
        self.inner.compare_and_delete(key, expected)
    }
}

#[test]
fn test_drain_attempts_follow_creation_order() {
    let store = Arc::new(RecordingStore {
        inner: MemoryStore::new(),
        attempts: Mutex::new(Vec::new()),
        stolen: Mutex::new(None),
    });
    let entries = seed(&*store, 3);
    *store.stolen.lock() = Some(entries[1].key.clone());

    let (transport, receiver) = ChannelTransport::pair();
    let handle = ConsumerSession::spawn(
        SessionId(7),
        SessionConfig::default(),
        Arc::clone(&store) as Arc<dyn EntryStore>,
        Arc::new(Notifier::new()),
        transport,
    )
    .unwrap();
    assert!(handle.wait_for_state(SessionState::Live, Duration::from_secs(5)));

    let attempted: Vec<EntryKey> = store.attempts.lock().clone();
    let expected: Vec<EntryKey> = entries.iter().map(|e| e.key.clone()).collect();
    assert_eq!(attempted, expected);

    // The stolen middle entry is skipped, the others arrive in order.
    assert_eq!(
        receiver.drain(),
        vec![entries[0].value.clone(), entries[2].value.clone()]
    );

    let summary = handle.close().unwrap();
    assert_eq!(summary.delivered, 2);
    assert_eq!(summary.already_claimed, 1);
}
