//! Durability tests: restarts, torn log tails, exclusive access.

use courier::{
    ChannelTransport, CommitOutcome, DurableStore, EntryKey, EntryStore, IdGenerator, Relay, RelayConfig,
    RelayError, SessionState, StoreConfig,
};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

fn relay_config(dir: &Path) -> RelayConfig {
    RelayConfig {
        store: StoreConfig {
            path: dir.join("store"),
            ..Default::default()
        },
        auth_token: Some("token".into()),
        ..Default::default()
    }
}

#[test]
fn test_backlog_survives_restart() {
    let dir = TempDir::new().unwrap();

    {
        let relay = Relay::open(relay_config(dir.path())).unwrap();
        for value in ["first", "second", "third"] {
            relay.publish(Some("token"), value).unwrap();
        }
    }

    let relay = Relay::open(relay_config(dir.path())).unwrap();
    assert_eq!(relay.pending().unwrap().len(), 3);

    let (transport, inbox) = ChannelTransport::pair();
    let session = relay.connect(Some("token"), transport).unwrap();
    assert!(session.wait_for_state(SessionState::Live, WAIT));

    assert_eq!(
        inbox.drain(),
        vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
    );
    assert_eq!(session.close().unwrap().delivered, 3);
    assert!(relay.pending().unwrap().is_empty());
}

#[test]
fn test_claims_survive_restart() {
    let dir = TempDir::new().unwrap();

    {
        let relay = Relay::open(relay_config(dir.path())).unwrap();
        relay.publish(Some("token"), "claimed").unwrap();

        let (transport, inbox) = ChannelTransport::pair();
        let session = relay.connect(Some("token"), transport).unwrap();
        assert_eq!(inbox.recv_timeout(WAIT).unwrap(), b"claimed".to_vec());
        session.close().unwrap();

        relay.publish(Some("token"), "unclaimed").unwrap();
    }

    let relay = Relay::open(relay_config(dir.path())).unwrap();
    let pending = relay.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].value, b"unclaimed".to_vec());
}

#[test]
fn test_stale_versionstamp_conflicts_after_restart() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig {
        path: dir.path().join("store"),
        ..Default::default()
    };
    let key = EntryKey::message(IdGenerator::new().next_id());

    let first = {
        let store = DurableStore::create(config.clone()).unwrap();
        let first = store.put(&key, b"v1").unwrap();
        store.compact().unwrap();
        first
    };

    let store = DurableStore::open(config).unwrap();
    let second = store.put(&key, b"v2").unwrap();
    assert!(second > first);

    assert_eq!(
        store.compare_and_delete(&key, first).unwrap(),
        CommitOutcome::Conflict
    );
    assert_eq!(
        store.compare_and_delete(&key, second).unwrap(),
        CommitOutcome::Committed
    );
}

#[test]
fn test_torn_tail_is_discarded() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig {
        path: dir.path().join("store"),
        ..Default::default()
    };
    let ids = IdGenerator::new();

    {
        let store = DurableStore::create(config.clone()).unwrap();
        for i in 0..5 {
            store
                .put(&EntryKey::message(ids.next_id()), format!("v{}", i).as_bytes())
                .unwrap();
        }
    }

    // A crash mid-append: a length prefix promising more than was written.
    let log_path = config.path.join("entries.log");
    let intact_len = std::fs::metadata(&log_path).unwrap().len();
    {
        let mut log = OpenOptions::new().append(true).open(&log_path).unwrap();
        log.write_all(&200u32.to_le_bytes()).unwrap();
        log.write_all(b"partial").unwrap();
    }

    let store = DurableStore::open(config.clone()).unwrap();
    assert_eq!(std::fs::metadata(&log_path).unwrap().len(), intact_len);

    let values: Vec<Vec<u8>> = store
        .list_ordered("messages")
        .unwrap()
        .into_iter()
        .map(|e| e.value)
        .collect();
    let expected: Vec<Vec<u8>> = (0..5).map(|i| format!("v{}", i).into_bytes()).collect();
    assert_eq!(values, expected);

    // New writes land after the intact prefix and survive another restart.
    store
        .put(&EntryKey::message(ids.next_id()), b"after")
        .unwrap();
    drop(store);

    let store = DurableStore::open(config).unwrap();
    assert_eq!(store.list_ordered("messages").unwrap().len(), 6);
}

#[test]
fn test_damaged_frame_before_a_claim_refuses_to_open() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig {
        path: dir.path().join("store"),
        ..Default::default()
    };
    let log_path = config.path.join("entries.log");
    let ids = IdGenerator::new();
    let a = EntryKey::message(ids.next_id());
    let b = EntryKey::message(ids.next_id());

    let b_frame = {
        let store = DurableStore::create(config.clone()).unwrap();
        let vs_a = store.put(&a, b"claimed").unwrap();
        let b_frame = std::fs::metadata(&log_path).unwrap().len();
        store.put(&b, b"pending").unwrap();
        assert_eq!(
            store.compare_and_delete(&a, vs_a).unwrap(),
            CommitOutcome::Committed
        );
        b_frame
    };

    // Damage B's frame; the delete of A sits intact after it.
    let mut bytes = std::fs::read(&log_path).unwrap();
    let len_before = bytes.len() as u64;
    bytes[b_frame as usize + 6] ^= 0xFF;
    std::fs::write(&log_path, &bytes).unwrap();

    let result = DurableStore::open(config);
    assert!(matches!(result, Err(RelayError::Corruption(_))));
    assert_eq!(std::fs::metadata(&log_path).unwrap().len(), len_before);
}

#[test]
fn test_second_relay_on_same_store_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let _relay = Relay::open(relay_config(dir.path())).unwrap();

    let result = Relay::open(relay_config(dir.path()));
    assert!(matches!(result, Err(RelayError::Locked)));
}

#[test]
fn test_missing_store_without_create() {
    let dir = TempDir::new().unwrap();
    let mut config = relay_config(dir.path());
    config.store.create_if_missing = false;

    let result = Relay::open(config);
    assert!(matches!(result, Err(RelayError::NotInitialized)));
}
