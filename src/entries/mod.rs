//! Entry storage.
//!
//! Pending messages live in an ordered key space. The relay only needs three
//! operations from a backend, captured by [`EntryStore`]:
//!
//! - `put`: durable write, returns the store-assigned versionstamp
//! - `list_ordered`: all live entries of a namespace in key order
//! - `compare_and_delete`: delete iff the versionstamp still matches
//!
//! [`MemoryStore`] is an in-process backend; the on-disk backend is
//! [`DurableStore`](crate::store::DurableStore), built from [`EntryLog`] and
//! [`EntryIndex`].

mod index;
mod log;
mod memory;

pub use index::{EntryIndex, IndexEntry};
pub use log::{EntryLog, LogOp};
pub use memory::MemoryStore;

use crate::error::Result;
use crate::types::{CommitOutcome, Entry, EntryKey, Versionstamp};

/// Ordered key-value backend with a linearizable conditional delete.
///
/// All three operations report backend failures as
/// [`RelayError::StoreUnavailable`](crate::error::RelayError::StoreUnavailable).
pub trait EntryStore: Send + Sync {
    /// Durably write `value` under `key` and return the new versionstamp.
    fn put(&self, key: &EntryKey, value: &[u8]) -> Result<Versionstamp>;

    /// Every live entry in `namespace`, ascending by key.
    fn list_ordered(&self, namespace: &str) -> Result<Vec<Entry>>;

    /// Delete `key` iff its current versionstamp equals `expected`.
    ///
    /// A missing key or a different versionstamp is `Ok(Conflict)`.
    fn compare_and_delete(&self, key: &EntryKey, expected: Versionstamp) -> Result<CommitOutcome>;
}
