//! The replicated-object contract.
//!
//! A domain object becomes cluster-replicated by expressing its state
//! transitions as log entries. The contract is split the same way the
//! runtime's executor splits it: a pure state-machine trait
//! ([`SharedObject`]) with no locks or positions in it, and a runtime-owned
//! handle ([`LogObject`]) that pairs the state with its current log
//! position behind one reader/writer lock.
//!
//! # Laws
//!
//! 1. `apply()` MUST be deterministic: same (state, entry) -> same state'.
//! 2. `apply()` MUST be infallible: every legality check belongs in
//!    `is_applicable()`, which runs first under the same lock.
//! 3. `is_applicable()` MUST NOT mutate state.
//! 4. `restore(snapshot(state))` MUST reproduce `state` exactly.
//! 5. Domain state changes only through `apply`/`restore` calls issued by
//!    the runtime, at strictly increasing gap-free positions.

pub mod atomic_long;

use std::error::Error;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::log::seq::SeqNum;
use crate::log::ObjectId;

pub use atomic_long::LogAtomicLong;

/// Pure state machine for one kind of replicated object.
pub trait SharedObject: Send + Sync + 'static {
    /// The domain state replayed from the log.
    type State: Clone + Send + Sync;

    /// Deterministic restore failure (corrupt or incompatible payload).
    type RestoreError: Error + Send + Sync + 'static;

    /// The empty initial state, before any entry has been applied.
    fn initial(&self) -> Self::State;

    /// Decides whether `payload` is legal against the current state.
    ///
    /// Pure predicate: a compare-and-set entry, for example, is applicable
    /// only if the expected value matches the present value.
    fn is_applicable(&self, state: &Self::State, seq: SeqNum, payload: &[u8]) -> bool;

    /// Applies one state-transition entry.
    ///
    /// Must be a pure function of (old state, payload) so replay on any
    /// replica produces identical results. Must not fail: anything that
    /// can go wrong is checked in `is_applicable` first.
    fn apply(&self, state: &mut Self::State, seq: SeqNum, payload: &[u8]);

    /// Serializes the full domain state for a snapshot.
    fn snapshot(&self, state: &Self::State) -> Vec<u8>;

    /// Rebuilds domain state from a snapshot payload.
    fn restore(&self, payload: &[u8]) -> Result<Self::State, Self::RestoreError>;
}

// =============================================================================
// REPLICA STATE
// =============================================================================

/// Domain state plus the log position it reflects.
///
/// Invariant: `state` is exactly the result of applying, in order, every
/// non-no-op entry at positions `<= current`.
pub struct Replica<S> {
    pub current: SeqNum,
    pub state: S,
}

// =============================================================================
// OBJECT HANDLE
// =============================================================================

/// One local instance of a replicated object.
///
/// The handle owns the reader/writer lock protecting the replica: the
/// runtime holds the write guard across its propose -> check -> commit ->
/// apply sequence so no second mutator can interleave, and across replay
/// so entries apply strictly in order. Reads take the read guard.
pub struct LogObject<A: SharedObject> {
    oid: ObjectId,
    app: A,
    replica: RwLock<Replica<A::State>>,
}

impl<A: SharedObject> LogObject<A> {
    /// Creates a handle at the empty initial state.
    ///
    /// Normally called through the runtime's `open`, which immediately
    /// resets the handle to the latest snapshot.
    pub fn new(oid: ObjectId, app: A) -> Arc<LogObject<A>> {
        let state = app.initial();
        Arc::new(LogObject {
            oid,
            app,
            replica: RwLock::new(Replica {
                current: SeqNum::INITIAL,
                state,
            }),
        })
    }

    pub fn oid(&self) -> &ObjectId {
        &self.oid
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    /// The log position this instance currently reflects.
    pub fn current(&self) -> SeqNum {
        self.read().current
    }

    /// Runs `f` against the domain state under the read lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&A::State, SeqNum) -> R) -> R {
        let replica = self.read();
        f(&replica.state, replica.current)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Replica<A::State>> {
        self.replica.read().unwrap()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Replica<A::State>> {
        self.replica.write().unwrap()
    }
}
