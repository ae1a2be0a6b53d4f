//! replog: shared-log replication runtime.
//!
//! Turns any in-memory object into a linearizable, cluster-replicated
//! object by expressing its state transitions as entries appended to a
//! per-object shared log. The backing cluster store only has to provide
//! single-key atomicity (conditional writes) and atomic counters; this
//! runtime builds multi-step, conflict-aware replication on top:
//!
//! - global sequencing through a per-object [`log::Sequencer`]
//! - optimistic-concurrency commit (`put_if_absent`: one winner per
//!   position)
//! - deterministic catch-up replay through a notification-fed near-cache
//! - periodic background snapshots and log trimming
//!
//! Domain objects implement [`object::SharedObject`]; see
//! [`object::LogAtomicLong`] for a complete example.

pub mod log;
pub mod object;
pub mod runtime;
pub mod store;

pub use log::{LogEntry, ObjectId, SeqNum, SnapshotEntry};
pub use object::{LogAtomicLong, LogObject, SharedObject};
pub use runtime::{LogRuntime, RestoreError, RuntimeConfig, UpdateError};
pub use store::{ClusterStore, MemoryStore};
