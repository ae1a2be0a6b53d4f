//! Runtime error types.

use std::fmt;

use crate::log::seq::SeqNum;
use crate::log::ObjectId;

// =============================================================================
// UPDATE ERRORS
// =============================================================================

/// Failure of an update proposal.
///
/// Only these two outcomes cross the runtime boundary; write races and
/// read timeouts are resolved internally by retry.
#[derive(Debug)]
pub enum UpdateError {
    /// `is_applicable` returned false: the proposed mutation is
    /// semantically invalid against current state (e.g. a failed
    /// compare-and-set). Definitive; the allocated position has been
    /// burned with a no-op so no replica can later apply a stale entry
    /// there.
    Rejected { oid: ObjectId, seq: SeqNum },

    /// Every attempt lost its position to another replica's no-op
    /// invalidation. The runtime will not retry further; the caller may.
    RetriesExhausted { oid: ObjectId, attempts: u32 },
}

impl UpdateError {
    /// True if the caller may meaningfully retry the same proposal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpdateError::RetriesExhausted { .. })
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::Rejected { oid, seq } => {
                write!(f, "entry rejected by {} at {}", oid, seq)
            }
            UpdateError::RetriesExhausted { oid, attempts } => {
                write!(
                    f,
                    "update of {} lost the log race {} times",
                    oid, attempts
                )
            }
        }
    }
}

impl std::error::Error for UpdateError {}

// =============================================================================
// RESTORE ERRORS
// =============================================================================

/// Failure to reset an object to a snapshot.
#[derive(Debug)]
pub enum RestoreError {
    /// The requested snapshot position has no stored snapshot and is not
    /// `INITIAL`. Fatal for this restore attempt: construction fails
    /// rather than silently starting from empty state.
    SnapshotNotFound { oid: ObjectId, seq: SeqNum },

    /// The stored snapshot payload could not be restored.
    Restore { oid: ObjectId, seq: SeqNum, message: String },
}

impl fmt::Display for RestoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreError::SnapshotNotFound { oid, seq } => {
                write!(f, "no snapshot for {} at {}", oid, seq)
            }
            RestoreError::Restore { oid, seq, message } => {
                write!(f, "restoring {} at {} failed: {}", oid, seq, message)
            }
        }
    }
}

impl std::error::Error for RestoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        let rejected = UpdateError::Rejected {
            oid: ObjectId::new("x"),
            seq: SeqNum::of(1),
        };
        let exhausted = UpdateError::RetriesExhausted {
            oid: ObjectId::new("x"),
            attempts: 5,
        };
        assert!(!rejected.is_retryable());
        assert!(exhausted.is_retryable());
    }
}
