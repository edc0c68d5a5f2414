//! Claim protocol.
//!
//! The versionstamp captured when an entry was observed is the ticket: a
//! conditional delete against it succeeds for exactly one caller. Winners
//! deliver; losers drop the entry without re-reading anything.

use crate::entries::EntryStore;
use crate::error::{RelayError, Result};
use crate::transport::Transport;
use crate::types::{CommitOutcome, Entry};
use tracing::trace;

/// Result of one claim attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller won and the value went to its transport.
    Delivered,
    /// Someone else (or an earlier attempt) already took the entry.
    AlreadyClaimed,
}

/// Try to claim `entry` and, on success, send its value over `transport`.
///
/// Never retries. A send failure after a committed claim is reported as
/// [`RelayError::DeliveryFailure`]; the entry is gone from the store either way.
pub fn claim(store: &dyn EntryStore, entry: &Entry, transport: &dyn Transport) -> Result<ClaimOutcome> {
    match store.compare_and_delete(&entry.key, entry.versionstamp)? {
        CommitOutcome::Conflict => {
            trace!(key = %entry.key, versionstamp = %entry.versionstamp, "claim lost");
            Ok(ClaimOutcome::AlreadyClaimed)
        }
        CommitOutcome::Committed => {
            transport
                .send(&entry.value)
                .map_err(|e| RelayError::DeliveryFailure {
                    key: entry.key.to_string(),
                    reason: e.to_string(),
                })?;
            Ok(ClaimOutcome::Delivered)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entries::MemoryStore;
    use crate::transport::ChannelTransport;
    use crate::types::{EntryKey, IdGenerator};

    fn seeded(store: &MemoryStore, value: &[u8]) -> Entry {
        let key = EntryKey::message(IdGenerator::new().next_id());
        let versionstamp = store.put(&key, value).unwrap();
        Entry {
            key,
            value: value.to_vec(),
            versionstamp,
        }
    }

    #[test]
    fn test_double_observation_delivers_once() {
        let store = MemoryStore::new();
        let (transport, receiver) = ChannelTransport::pair();
        let entry = seeded(&store, b"hello");

        assert_eq!(claim(&store, &entry, &transport).unwrap(), ClaimOutcome::Delivered);
        assert_eq!(
            claim(&store, &entry, &transport).unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
        assert_eq!(receiver.drain(), vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_delivery_failure_still_consumes_entry() {
        let store = MemoryStore::new();
        let (transport, receiver) = ChannelTransport::pair();
        drop(receiver);
        let entry = seeded(&store, b"lost");

        let result = claim(&store, &entry, &transport);
        assert!(matches!(result, Err(RelayError::DeliveryFailure { .. })));
        assert!(store.is_empty());
    }

    #[test]
    fn test_store_failure_is_not_a_conflict() {
        let store = MemoryStore::new();
        let (transport, receiver) = ChannelTransport::pair();
        let entry = seeded(&store, b"kept");

        store.set_available(false);
        let err = claim(&store, &entry, &transport).unwrap_err();
        assert!(err.is_store_unavailable());
        assert!(receiver.drain().is_empty());

        store.set_available(true);
        assert_eq!(store.len(), 1);
    }
}
