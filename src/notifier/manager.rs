//! Fan-out of new-entry events to live subscribers.

use crate::types::Entry;
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace};

use super::types::{
    DropReason, NotifierEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
};

/// Internal subscription state.
struct Subscription {
    config: SubscriptionConfig,
    sender: Sender<NotifierEvent>,
}

impl Subscription {
    /// Try to send an event. Returns false if buffer is full (subscriber will be dropped).
    fn try_send(&self, event: NotifierEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => false,
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Process-wide publish/subscribe for new entries.
///
/// Delivery is best-effort: a subscriber whose buffer is full is removed and
/// told so, and broadcasting never blocks. The entry store stays the source
/// of truth; subscribers recover by re-reading it.
pub struct Notifier {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    /// Set once `shutdown` has run.
    shut_down: AtomicBool,
}

impl Notifier {
    /// Create a new notifier.
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Create a new subscription.
    ///
    /// After `shutdown`, the returned handle only yields `Dropped { Shutdown }`.
    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size.max(1));

        let mut subs = self.subscriptions.write();
        if self.shut_down.load(Ordering::SeqCst) {
            let _ = sender.try_send(NotifierEvent::Dropped {
                reason: DropReason::Shutdown,
            });
        } else {
            subs.insert(id, Subscription { config, sender });
        }

        SubscriptionHandle { id, receiver }
    }

    /// Unsubscribe and clean up.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.subscriptions.write();
        if let Some(sub) = subs.remove(&id) {
            // Send dropped event (best effort)
            let _ = sub.sender.try_send(NotifierEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    /// Whether `shutdown` has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Broadcast a new entry to matching subscriptions.
    ///
    /// Returns how many subscribers accepted the event.
    pub fn broadcast_entry(&self, entry: &Entry) -> usize {
        let mut delivered = 0;
        let mut to_remove = Vec::new();

        {
            let subs = self.subscriptions.read();
            for (id, sub) in subs.iter() {
                if !sub.config.filter.matches(entry) {
                    continue;
                }
                let event = NotifierEvent::Entry {
                    entry: entry.clone(),
                };
                if sub.try_send(event) {
                    delivered += 1;
                } else {
                    to_remove.push(*id);
                }
            }
        }

        // Remove dropped subscriptions
        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    debug!(subscription = id.0, "dropping lagging subscriber");
                    // A full buffer may still refuse this; the closed channel tells the rest.
                    let _ = sub.sender.try_send(NotifierEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }

        trace!(key = %entry.key, delivered, "broadcast entry");
        delivered
    }

    /// Drop every subscriber and refuse new ones.
    pub fn shutdown(&self) {
        let mut subs = self.subscriptions.write();
        self.shut_down.store(true, Ordering::SeqCst);
        for (_, sub) in subs.drain() {
            let _ = sub.sender.try_send(NotifierEvent::Dropped {
                reason: DropReason::Shutdown,
            });
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::SubscriptionFilter;
    use crate::types::{EntryKey, IdGenerator, Versionstamp};
    use std::time::Duration;

    fn make_entry(namespace: &str) -> Entry {
        Entry {
            key: EntryKey::new(namespace, IdGenerator::new().next_id()),
            value: b"payload".to_vec(),
            versionstamp: Versionstamp(1),
        }
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let notifier = Notifier::new();

        let handle = notifier.subscribe(SubscriptionConfig::default());
        assert_eq!(notifier.subscription_count(), 1);

        notifier.unsubscribe(handle.id);
        assert_eq!(notifier.subscription_count(), 0);

        let event = handle.recv_timeout(Duration::from_millis(100)).unwrap();
        assert!(matches!(
            event,
            NotifierEvent::Dropped {
                reason: DropReason::Unsubscribed
            }
        ));
    }

    #[test]
    fn test_broadcast_reaches_every_subscriber() {
        let notifier = Notifier::new();
        let first = notifier.subscribe(SubscriptionConfig::default());
        let second = notifier.subscribe(SubscriptionConfig::default());

        let entry = make_entry("messages");
        assert_eq!(notifier.broadcast_entry(&entry), 2);

        for handle in [&first, &second] {
            match handle.recv_timeout(Duration::from_millis(100)).unwrap() {
                NotifierEvent::Entry { entry: got } => assert_eq!(got, entry),
                other => panic!("Expected Entry event, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_broadcast_filters_namespace() {
        let notifier = Notifier::new();
        let config = SubscriptionConfig {
            filter: SubscriptionFilter::namespace("messages"),
            ..Default::default()
        };
        let handle = notifier.subscribe(config);

        assert_eq!(notifier.broadcast_entry(&make_entry("audit")), 0);

        let result = handle.recv_timeout(Duration::from_millis(50));
        assert!(result.is_err());
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        let notifier = Notifier::new();
        assert_eq!(notifier.broadcast_entry(&make_entry("messages")), 0);
    }

    #[test]
    fn test_drop_slow_subscriber() {
        let notifier = Notifier::new();
        let config = SubscriptionConfig {
            buffer_size: 2,
            ..Default::default()
        };
        let handle = notifier.subscribe(config);

        // Flood with events
        for _ in 0..10 {
            notifier.broadcast_entry(&make_entry("messages"));
        }

        // Subscriber should be dropped
        assert_eq!(notifier.subscription_count(), 0);

        // The buffered events are still readable, then the channel closes.
        let drained: Vec<NotifierEvent> = handle.receiver.iter().collect();
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn test_shutdown_drops_everyone() {
        let notifier = Notifier::new();
        let before = notifier.subscribe(SubscriptionConfig::default());
        notifier.shutdown();
        let after = notifier.subscribe(SubscriptionConfig::default());

        assert_eq!(notifier.subscription_count(), 0);
        for handle in [&before, &after] {
            assert!(matches!(
                handle.recv_timeout(Duration::from_millis(100)).unwrap(),
                NotifierEvent::Dropped {
                    reason: DropReason::Shutdown
                }
            ));
        }
    }
}
