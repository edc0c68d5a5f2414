//! Fan-out notifier for new entries.
//!
//! Producers broadcast every successfully written entry; each connected
//! consumer session holds one subscription and races the others to claim it.
//!
//! Subscriptions support:
//! - Filtering by namespace
//! - Bounded buffers with slow-subscriber dropping
//! - Shutdown of every subscriber at once
//!
//! # Example
//!
//! ```ignore
//! let notifier = Notifier::new();
//! let handle = notifier.subscribe(SubscriptionConfig {
//!     filter: SubscriptionFilter::namespace("messages"),
//!     ..Default::default()
//! });
//!
//! loop {
//!     match handle.receiver.recv() {
//!         Ok(NotifierEvent::Entry { entry }) => println!("claimable: {}", entry.key),
//!         Ok(NotifierEvent::Dropped { reason }) => break,
//!         Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::Notifier;
pub use types::{
    DropReason, NotifierEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId,
};
