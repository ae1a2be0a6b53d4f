//! Cluster store boundary.
//!
//! The runtime does not talk to a concrete cluster store; it is handed a
//! [`ClusterStore`] capability that vends, per object, the three shared
//! namespaces (log map, snapshot map, latest-snapshot counter) plus the
//! sequencer counter. The store is assumed strongly consistent with
//! per-key atomicity; `put_if_absent` on the log map is the sole
//! concurrency-control primitive the runtime relies on.

pub mod fault;
pub mod memory;

use std::sync::Arc;

use crate::log::seq::SeqNum;
use crate::log::{LogEntry, ObjectId, SnapshotEntry};

pub use fault::FaultyStore;
pub use memory::MemoryStore;

// Cluster-wide namespace prefixes, one set per object.
pub const LOG_PREFIX: &str = "log://";
pub const SNAPSHOT_PREFIX: &str = "snapshot://";
pub const LATEST_SNAPSHOT_PREFIX: &str = "latestSnapshot://";
pub const SEQUENCER_PREFIX: &str = "seq://";

// =============================================================================
// MAP EVENTS
// =============================================================================

/// Change notification emitted by a shared map.
#[derive(Clone, Debug)]
pub enum MapEvent<V> {
    Added { key: SeqNum, value: V },
    Updated { key: SeqNum, value: V },
    Removed { key: SeqNum },
}

/// Receives change notifications for one shared map.
///
/// Listeners are invoked on the store's notification context, possibly
/// while the mutating caller still holds object locks: implementations
/// must be fast and must not call back into the runtime.
pub trait MapListener<V>: Send + Sync {
    fn on_event(&self, event: &MapEvent<V>);
}

// =============================================================================
// SHARED MAP
// =============================================================================

/// One per-object namespace map in the cluster store, keyed by `SeqNum`.
///
/// All operations are atomic per key.
pub trait SharedMap<V: Clone>: Send + Sync {
    /// The value at `key`, or `None` if absent.
    fn get(&self, key: SeqNum) -> Option<V>;

    /// Unconditionally stores `value`, returning the previous value.
    fn put(&self, key: SeqNum, value: V) -> Option<V>;

    /// Stores `value` only if `key` is absent.
    ///
    /// Returns the value that ended up stored: the caller's own if it won
    /// the race, otherwise whichever value got there first. Exactly one
    /// writer can ever win a given key.
    fn put_if_absent(&self, key: SeqNum, value: V) -> V;

    /// Removes the entry at `key`, returning it if present.
    fn remove(&self, key: SeqNum) -> Option<V>;

    /// A point-in-time copy of the key set.
    fn keys(&self) -> Vec<SeqNum>;

    /// Registers a change-notification listener.
    fn add_listener(&self, listener: Arc<dyn MapListener<V>>);
}

// =============================================================================
// ATOMIC COUNTER
// =============================================================================

/// Cluster-wide atomic counter.
pub trait AtomicCounter: Send + Sync {
    /// Current value.
    fn get(&self) -> u64;

    /// Atomically increments and returns the new value.
    fn increment(&self) -> u64;

    /// Atomically replaces the value with `f(current)`, retrying on
    /// contention, and returns the value that ended up stored.
    fn update(&self, f: &dyn Fn(u64) -> u64) -> u64;
}

// =============================================================================
// CLUSTER STORE
// =============================================================================

/// Vends the per-object shared namespaces.
///
/// Repeated calls with the same id must address the same underlying
/// cluster-wide state (handles may be freshly allocated).
pub trait ClusterStore: Send + Sync {
    /// `log://<id>`: SeqNum -> LogEntry, the object's shared log.
    fn log_map(&self, oid: &ObjectId) -> Arc<dyn SharedMap<LogEntry>>;

    /// `snapshot://<id>`: SeqNum -> SnapshotEntry.
    fn snapshot_map(&self, oid: &ObjectId) -> Arc<dyn SharedMap<SnapshotEntry>>;

    /// `latestSnapshot://<id>`: position of the most recent snapshot.
    fn latest_snapshot_counter(&self, oid: &ObjectId) -> Arc<dyn AtomicCounter>;

    /// `seq://<id>`: the object's sequencer counter.
    fn sequencer_counter(&self, oid: &ObjectId) -> Arc<dyn AtomicCounter>;
}
