//! Shared-log data model: object identity, log entries, snapshot entries.
//!
//! A replicated object's history is a per-object append-only log of
//! `LogEntry` values keyed by `SeqNum`, with periodic `SnapshotEntry`
//! checkpoints. Entries are immutable once written; positions are retired
//! only by the trim process.

pub mod cache;
pub mod seq;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use cache::{LogCache, LogListener, PendingRead};
pub use seq::{SeqNum, Sequencer};

// =============================================================================
// OBJECT IDENTITY
// =============================================================================

/// Stable, human-readable name identifying one replicated object across the
/// cluster. Namespaces its log, snapshot store, sequencer, and cache.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(name: impl Into<String>) -> ObjectId {
        ObjectId(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

// =============================================================================
// LOG ENTRY
// =============================================================================

/// One immutable record at a log position.
///
/// Either an opaque state-transition payload, or a no-op marker meaning
/// "this position is permanently empty, skip it". The no-op is written to
/// burn a position: after a rejected proposal, or when a writer that
/// reserved the position is presumed dead.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    /// Opaque serialized state-transition event.
    Payload(Vec<u8>),
    /// Position permanently empty; advances the cursor, changes nothing.
    NoOp,
}

impl LogEntry {
    pub fn is_noop(&self) -> bool {
        matches!(self, LogEntry::NoOp)
    }

    /// Payload bytes, if this is a payload entry.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            LogEntry::Payload(bytes) => Some(bytes),
            LogEntry::NoOp => None,
        }
    }
}

// =============================================================================
// SNAPSHOT ENTRY
// =============================================================================

/// A serialized full-state checkpoint at a log position.
///
/// `Empty` stands for the empty initial state: restoring it resets an
/// object to what it looked like before any entry was applied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotEntry {
    /// Serialized full object state.
    Payload(Vec<u8>),
    /// Empty initial state.
    Empty,
}

impl SnapshotEntry {
    pub fn is_empty(&self) -> bool {
        matches!(self, SnapshotEntry::Empty)
    }
}
