//! Consumer sessions.
//!
//! One session runs per connected consumer, on its own thread:
//!
//! ```text
//! Connecting -> Draining -> Live -> Closed
//!                  ^          |
//!                  +----------+  (notifier dropped us: re-scan)
//! ```
//!
//! The session subscribes before it scans the backlog, so entries announced
//! during the scan are buffered and tried afterwards. Seeing an entry twice
//! is harmless: the second claim conflicts.

use crate::claim::{claim, ClaimOutcome};
use crate::entries::EntryStore;
use crate::error::{RelayError, Result};
use crate::notifier::{
    DropReason, Notifier, NotifierEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
};
use crate::transport::Transport;
use crate::types::{Entry, DEFAULT_NAMESPACE};
use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// How often a live session re-checks its transport while idle.
const TRANSPORT_POLL: Duration = Duration::from_millis(50);

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Draining,
    Live,
    Closed,
}

/// Session configuration.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Namespace to drain and watch.
    pub namespace: String,

    /// Notifier buffer for this session.
    pub buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            buffer_size: 1000,
        }
    }
}

/// Unique identifier for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Counters for one session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Claim attempts issued.
    pub attempts: u64,
    /// Claims won and handed to the transport.
    pub delivered: u64,
    /// Claims lost to another session or an earlier attempt.
    pub already_claimed: u64,
    /// Claims won whose send then failed.
    pub delivery_failures: u64,
    /// Scans or claims abandoned because the store failed.
    pub store_errors: u64,
    /// Times the backlog was re-scanned after losing the subscription.
    pub resyncs: u64,
}

#[derive(Default)]
struct Counters {
    attempts: AtomicU64,
    delivered: AtomicU64,
    already_claimed: AtomicU64,
    delivery_failures: AtomicU64,
    store_errors: AtomicU64,
    resyncs: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            attempts: self.attempts.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            already_claimed: self.already_claimed.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    state: RwLock<SessionState>,
    counters: Counters,
}

/// Why the live phase ended.
enum LiveExit {
    Closed,
    Resync,
}

/// Owner's view of a running session.
///
/// Dropping the handle closes the session without waiting for it.
pub struct SessionHandle {
    id: SessionId,
    shared: Arc<Shared>,
    close_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<SessionSummary>>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.shared.state.read()
    }

    /// Counters so far.
    pub fn summary(&self) -> SessionSummary {
        self.shared.counters.summary()
    }

    /// Poll until the session reaches `state` or `timeout` passes.
    pub fn wait_for_state(&self, state: SessionState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state() == state {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stop the session and wait for it.
    ///
    /// An attempt already in progress finishes; no new ones start.
    pub fn close(mut self) -> Result<SessionSummary> {
        self.close_tx.take();
        self.wait()
    }

    /// Wait for the session to end on its own (transport or notifier closed).
    pub fn join(mut self) -> Result<SessionSummary> {
        self.wait()
    }

    fn wait(&mut self) -> Result<SessionSummary> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| RelayError::SessionPanicked),
            None => Ok(self.summary()),
        }
    }
}

/// A consumer session: drain the backlog, then claim live notifications.
pub struct ConsumerSession<T> {
    id: SessionId,
    config: SessionConfig,
    store: Arc<dyn EntryStore>,
    notifier: Arc<Notifier>,
    transport: T,
    close_rx: Receiver<()>,
    shared: Arc<Shared>,
}

impl<T: Transport + 'static> ConsumerSession<T> {
    /// Start a session on its own thread.
    pub fn spawn(
        id: SessionId,
        config: SessionConfig,
        store: Arc<dyn EntryStore>,
        notifier: Arc<Notifier>,
        transport: T,
    ) -> Result<SessionHandle> {
        let (close_tx, close_rx) = bounded(1);
        let shared = Arc::new(Shared {
            state: RwLock::new(SessionState::Connecting),
            counters: Counters::default(),
        });

        let session = ConsumerSession {
            id,
            config,
            store,
            notifier,
            transport,
            close_rx,
            shared: Arc::clone(&shared),
        };

        let thread = thread::Builder::new()
            .name(format!("courier-session-{}", id))
            .spawn(move || session.run())?;

        Ok(SessionHandle {
            id,
            shared,
            close_tx: Some(close_tx),
            thread: Some(thread),
        })
    }

    fn run(self) -> SessionSummary {
        debug!(session = %self.id, namespace = %self.config.namespace, "session started");

        while !self.should_stop() {
            let subscription = self.notifier.subscribe(SubscriptionConfig {
                buffer_size: self.config.buffer_size,
                filter: SubscriptionFilter::namespace(self.config.namespace.clone()),
            });

            self.set_state(SessionState::Draining);
            if !self.drain() {
                self.notifier.unsubscribe(subscription.id);
                break;
            }

            self.set_state(SessionState::Live);
            let exit = self.live(&subscription);
            self.notifier.unsubscribe(subscription.id);

            match exit {
                LiveExit::Closed => break,
                LiveExit::Resync => {
                    Counters::bump(&self.shared.counters.resyncs);
                    debug!(session = %self.id, "subscription lost, rescanning backlog");
                }
            }
        }

        self.set_state(SessionState::Closed);
        let summary = self.shared.counters.summary();
        debug!(session = %self.id, ?summary, "session closed");
        summary
    }

    /// Claim every backlog entry in key order. Returns false if closed midway.
    fn drain(&self) -> bool {
        let backlog = match self.store.list_ordered(&self.config.namespace) {
            Ok(backlog) => backlog,
            Err(e) => {
                Counters::bump(&self.shared.counters.store_errors);
                warn!(session = %self.id, error = %e, "backlog scan failed");
                return true;
            }
        };

        trace!(session = %self.id, backlog = backlog.len(), "draining backlog");
        for entry in &backlog {
            if self.should_stop() {
                return false;
            }
            self.attempt(entry);
        }
        true
    }

    fn live(&self, subscription: &SubscriptionHandle) -> LiveExit {
        loop {
            if self.should_stop() {
                return LiveExit::Closed;
            }

            select! {
                recv(subscription.receiver) -> event => match event {
                    Ok(NotifierEvent::Entry { entry }) => {
                        if self.should_stop() {
                            return LiveExit::Closed;
                        }
                        self.attempt(&entry);
                    }
                    Ok(NotifierEvent::Dropped { reason: DropReason::BufferOverflow }) => {
                        return LiveExit::Resync;
                    }
                    Ok(NotifierEvent::Dropped { .. }) => return LiveExit::Closed,
                    // Overflow removal may close the channel without a Dropped event.
                    Err(_) if self.notifier.is_shut_down() => return LiveExit::Closed,
                    Err(_) => return LiveExit::Resync,
                },
                recv(self.close_rx) -> _ => return LiveExit::Closed,
                default(TRANSPORT_POLL) => {}
            }
        }
    }

    fn attempt(&self, entry: &Entry) {
        let counters = &self.shared.counters;
        Counters::bump(&counters.attempts);

        match claim(&*self.store, entry, &self.transport) {
            Ok(ClaimOutcome::Delivered) => {
                Counters::bump(&counters.delivered);
                trace!(session = %self.id, key = %entry.key, "delivered");
            }
            Ok(ClaimOutcome::AlreadyClaimed) => {
                Counters::bump(&counters.already_claimed);
            }
            Err(e @ RelayError::DeliveryFailure { .. }) => {
                Counters::bump(&counters.delivery_failures);
                warn!(session = %self.id, key = %entry.key, error = %e, "claimed entry was not delivered");
            }
            Err(e) => {
                Counters::bump(&counters.store_errors);
                warn!(session = %self.id, key = %entry.key, error = %e, "claim attempt abandoned");
            }
        }
    }

    fn should_stop(&self) -> bool {
        if self.transport.is_closed() {
            return true;
        }
        // Nothing is ever sent; the handle closes us by dropping its sender.
        matches!(self.close_rx.try_recv(), Ok(()) | Err(TryRecvError::Disconnected))
    }

    fn set_state(&self, state: SessionState) {
        *self.shared.state.write() = state;
    }
}
