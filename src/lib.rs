//! # Courier
//!
//! A durable fan-out message relay. Producers enqueue messages into an
//! ordered entry store; every connected consumer races to claim each one,
//! and exactly one wins.
//!
//! ## Core Concepts
//!
//! - **Entries**: pending messages keyed by time-ordered ids, each carrying a
//!   store-assigned versionstamp
//! - **Claims**: a conditional delete against the observed versionstamp; the
//!   single winner delivers
//! - **Notifier**: best-effort broadcast of new entries to live sessions
//! - **Sessions**: drain the backlog, then claim live notifications
//!
//! ## Example
//!
//! ```ignore
//! use courier::{ChannelTransport, Relay, RelayConfig};
//!
//! let relay = Relay::open(RelayConfig::from_env()?)?;
//!
//! // Nobody is listening yet; the message waits in the store.
//! relay.publish(Some("token"), "hello")?;
//!
//! // The first consumer to connect drains and claims it.
//! let (transport, inbox) = ChannelTransport::pair();
//! let session = relay.connect(Some("token"), transport)?;
//! ```

pub mod auth;
pub mod claim;
pub mod entries;
pub mod error;
pub mod notifier;
pub mod producer;
pub mod relay;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

// Re-exports
pub use auth::{AllowAll, Authenticator, TokenAuthenticator};
pub use claim::{claim, ClaimOutcome};
pub use entries::{EntryIndex, EntryLog, EntryStore, IndexEntry, LogOp, MemoryStore};
pub use error::{RelayError, Result};
pub use notifier::{
    DropReason, Notifier, NotifierEvent, SubscriptionConfig, SubscriptionFilter,
    SubscriptionHandle, SubscriptionId,
};
pub use producer::Producer;
pub use relay::{Relay, RelayConfig};
pub use session::{
    ConsumerSession, SessionConfig, SessionHandle, SessionId, SessionState, SessionSummary,
};
pub use store::{CompactionSummary, DurableStore, StoreConfig};
pub use transport::{ChannelTransport, Transport, TransportReceiver};
pub use types::*;
