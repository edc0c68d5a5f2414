//! Producer side: durable write, then fan-out.

use crate::entries::EntryStore;
use crate::error::Result;
use crate::notifier::Notifier;
use crate::types::{Entry, EntryKey, IdGenerator};
use std::sync::Arc;
use tracing::{debug, warn};

/// Writes new entries and announces them.
pub struct Producer {
    namespace: String,
    store: Arc<dyn EntryStore>,
    notifier: Arc<Notifier>,
    ids: IdGenerator,
}

impl Producer {
    pub fn new(namespace: impl Into<String>, store: Arc<dyn EntryStore>, notifier: Arc<Notifier>) -> Self {
        Self {
            namespace: namespace.into(),
            store,
            notifier,
            ids: IdGenerator::new(),
        }
    }

    /// Durably enqueue `value` and notify live sessions.
    ///
    /// Success means the entry is in the store, whether or not anyone was
    /// listening. If the store write fails nothing is broadcast.
    pub fn publish(&self, value: impl Into<Vec<u8>>) -> Result<Entry> {
        let key = EntryKey::new(self.namespace.clone(), self.ids.next_id());
        let value = value.into();

        let versionstamp = self.store.put(&key, &value).map_err(|e| {
            warn!(key = %key, error = %e, "publish failed");
            e
        })?;

        let entry = Entry {
            key,
            value,
            versionstamp,
        };
        let notified = self.notifier.broadcast_entry(&entry);
        debug!(key = %entry.key, versionstamp = %versionstamp, notified, "published entry");

        Ok(entry)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}
