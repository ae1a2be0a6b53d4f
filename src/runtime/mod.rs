//! The log-based replication runtime.
//!
//! Turns the cluster store's single-key atomicity into multi-step,
//! conflict-aware object replication:
//! - `update`: propose + conditionally commit a new log entry (optimistic
//!   concurrency: exactly one writer wins each position)
//! - `query` / `query_to`: catch an object up by deterministic in-order
//!   replay
//! - background snapshot creation and log trimming
//!
//! There is no global lock anywhere: correctness rests on the store's
//! conditional write and the sequencer's atomic allocation, plus each
//! object's local reader/writer lock.

mod error;
mod snapshot;
mod worker;


use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::log::cache::{LogCache, LogListener, PendingRead};
use crate::log::seq::{SeqNum, Sequencer};
use crate::log::{LogEntry, ObjectId, SnapshotEntry};
use crate::object::{LogObject, SharedObject};
use crate::store::ClusterStore;

pub use error::{RestoreError, UpdateError};
pub use worker::WorkerPool;

// =============================================================================
// CONFIG
// =============================================================================

/// Runtime tunables.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Times to retry an update whose position was invalidated by another
    /// replica before surfacing `RetriesExhausted`.
    pub update_retries: u32,

    /// Per-position deadline when replaying: how long a reserved but not
    /// yet observable entry is waited for before its writer is presumed
    /// dead and the position poisoned.
    pub log_read_timeout: Duration,

    /// Re-poll cadence against the store while waiting out
    /// `log_read_timeout` (notifications may have been missed).
    pub read_poll_interval: Duration,

    /// A snapshot check is scheduled when a committed position is a
    /// multiple of this value.
    pub snapshot_check_interval: u64,

    /// Minimum gap between the latest snapshot and `current` before a new
    /// snapshot is actually written.
    pub snapshot_interval: i64,

    /// Snapshots retained per object; excess oldest ones are deleted and
    /// the log trimmed behind them.
    pub max_snapshots: usize,

    /// Background worker threads for snapshot/trim work.
    pub worker_threads: usize,

    /// Pending background tasks kept before drop-oldest kicks in.
    pub worker_queue_depth: usize,

    /// Near-cache capacity (log positions) per object.
    pub cache_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> RuntimeConfig {
        RuntimeConfig {
            update_retries: 5,
            log_read_timeout: Duration::from_millis(1000),
            read_poll_interval: Duration::from_millis(50),
            snapshot_check_interval: 50,
            snapshot_interval: 500,
            max_snapshots: 10,
            worker_threads: 2,
            worker_queue_depth: 10,
            cache_capacity: 10_000,
        }
    }
}

// =============================================================================
// RUNTIME
// =============================================================================

/// State shared with background workers.
pub(crate) struct RuntimeShared {
    pub(crate) store: Arc<dyn ClusterStore>,
    pub(crate) config: RuntimeConfig,
    caches: Mutex<HashMap<ObjectId, Arc<LogCache>>>,
}

impl RuntimeShared {
    pub(crate) fn cache(&self, oid: &ObjectId) -> Arc<LogCache> {
        let mut caches = self.caches.lock().unwrap();
        caches
            .entry(oid.clone())
            .or_insert_with(|| {
                LogCache::new(oid.clone(), self.store.log_map(oid), self.config.cache_capacity)
            })
            .clone()
    }

    fn sequencer(&self, oid: &ObjectId) -> Sequencer {
        Sequencer::new(self.store.sequencer_counter(oid))
    }
}

/// Runtime to read and write replicated objects through a shared log.
pub struct LogRuntime {
    shared: Arc<RuntimeShared>,
    pool: WorkerPool,
}

impl LogRuntime {
    pub fn new(store: Arc<dyn ClusterStore>) -> LogRuntime {
        LogRuntime::with_config(store, RuntimeConfig::default())
    }

    pub fn with_config(store: Arc<dyn ClusterStore>, config: RuntimeConfig) -> LogRuntime {
        let pool = WorkerPool::new(config.worker_threads, config.worker_queue_depth);
        LogRuntime {
            shared: Arc::new(RuntimeShared {
                store,
                config,
                caches: Mutex::new(HashMap::new()),
            }),
            pool,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    // =========================================================================
    // CONSTRUCTION
    // =========================================================================

    /// Opens a replicated object, reset to the latest known snapshot (or
    /// the empty initial state if none exists).
    pub fn open<A: SharedObject>(
        &self,
        app: A,
        name: &str,
    ) -> Result<Arc<LogObject<A>>, RestoreError> {
        let oid = ObjectId::new(name);
        let latest = self.latest_snapshot(&oid);
        self.open_at(app, name, latest)
    }

    /// Opens a replicated object reset to a specific snapshot position.
    pub fn open_at<A: SharedObject>(
        &self,
        app: A,
        name: &str,
        snapshot_seq: SeqNum,
    ) -> Result<Arc<LogObject<A>>, RestoreError> {
        let obj = LogObject::new(ObjectId::new(name), app);
        self.reset_to_snapshot(&obj, snapshot_seq)?;
        Ok(obj)
    }

    /// Position of the most recent snapshot, `INITIAL` if none.
    pub fn latest_snapshot(&self, oid: &ObjectId) -> SeqNum {
        SeqNum::of(self.shared.store.latest_snapshot_counter(oid).get())
    }

    /// Resets `obj` to the snapshot at `snapshot_seq`.
    ///
    /// `INITIAL` always succeeds and yields the empty initial state. Any
    /// other position must have a stored snapshot: a missing one fails the
    /// restore rather than silently starting from empty state.
    pub fn reset_to_snapshot<A: SharedObject>(
        &self,
        obj: &LogObject<A>,
        snapshot_seq: SeqNum,
    ) -> Result<(), RestoreError> {
        let oid = obj.oid().clone();
        let stored = self.shared.store.snapshot_map(&oid).get(snapshot_seq);
        let entry = match stored {
            Some(entry) => entry,
            None if snapshot_seq.is_initial() => SnapshotEntry::Empty,
            None => {
                return Err(RestoreError::SnapshotNotFound {
                    oid,
                    seq: snapshot_seq,
                })
            }
        };

        let state = match &entry {
            SnapshotEntry::Empty => obj.app().initial(),
            SnapshotEntry::Payload(bytes) => {
                obj.app().restore(bytes).map_err(|e| RestoreError::Restore {
                    oid: oid.clone(),
                    seq: snapshot_seq,
                    message: e.to_string(),
                })?
            }
        };

        let mut replica = obj.write();
        replica.current = snapshot_seq;
        replica.state = state;
        trace!(%oid, %snapshot_seq, "reset to snapshot");
        Ok(())
    }

    // =========================================================================
    // UPDATE PATH
    // =========================================================================

    /// Proposes and commits one state-transition entry.
    ///
    /// # Semantics
    ///
    /// 1. Allocate a fresh position from the object's sequencer.
    /// 2. If `replay_first`, replay the object to just before the
    ///    allocated position so the applicability check sees every prior
    ///    mutation (required for compare-and-set style entries).
    /// 3. Under the object's write lock, evaluate `is_applicable`:
    ///    - not applicable: burn the position with a no-op (it can never
    ///      be reused) and fail with `Rejected`;
    ///    - applicable: conditionally write the entry. Exactly one writer
    ///      can occupy a position; if the stored value comes back as a
    ///      no-op, another replica invalidated our reservation and the
    ///      whole operation retries with a fresh position, up to the retry
    ///      budget. Otherwise the entry is ours: apply it locally and
    ///      return the position.
    /// 4. On a boundary position, schedule a background snapshot check.
    ///
    /// The write lock is released on every exit path (guard drop).
    pub fn update<A: SharedObject>(
        &self,
        obj: &Arc<LogObject<A>>,
        payload: Vec<u8>,
        replay_first: bool,
    ) -> Result<SeqNum, UpdateError> {
        let oid = obj.oid().clone();
        let log_map = self.shared.store.log_map(&oid);
        let sequencer = self.shared.sequencer(&oid);
        let retries = self.shared.config.update_retries;

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let allocated = sequencer.next();
            trace!(%oid, %allocated, "proposing update");

            if replay_first {
                self.query_to(obj, allocated.prev());
            }

            let mut replica = obj.write();

            if !obj
                .app()
                .is_applicable(&replica.state, allocated, &payload)
            {
                trace!(%oid, %allocated, "entry rejected, burning position");
                log_map.put_if_absent(allocated, LogEntry::NoOp);
                return Err(UpdateError::Rejected {
                    oid,
                    seq: allocated,
                });
            }

            let stored = log_map.put_if_absent(allocated, LogEntry::Payload(payload.clone()));
            if stored.is_noop() {
                // Another replica presumed us dead and poisoned the
                // position before our write landed.
                drop(replica);
                if attempts > retries {
                    warn!(%oid, attempts, "update retries exhausted");
                    return Err(UpdateError::RetriesExhausted { oid, attempts });
                }
                trace!(%oid, %allocated, "lost position, retrying");
                continue;
            }

            // The sequencer never hands out a position twice, so a
            // non-no-op stored value is necessarily our own entry.
            replica.current = allocated;
            obj.app().apply(&mut replica.state, allocated, &payload);
            drop(replica);

            if allocated.value() % self.shared.config.snapshot_check_interval == 0 {
                self.schedule_snapshot_check(obj);
            }
            return Ok(allocated);
        }
    }

    // =========================================================================
    // QUERY / REPLAY PATH
    // =========================================================================

    /// Replays `obj` up to the latest allocated position.
    pub fn query<A: SharedObject>(&self, obj: &LogObject<A>) {
        let target = self.shared.sequencer(obj.oid()).get();
        self.query_to(obj, target);
    }

    /// Replays `obj` up to `target`, applying every log entry in
    /// `(current, target]` strictly in order.
    ///
    /// Every position is fetched through the near-cache; all reads for the
    /// range are issued before the first wait so they can complete
    /// concurrently. A position that stays unobservable past the read
    /// deadline is poisoned with a no-op to unblock all replicas waiting
    /// on it. The poison is a conditional write, so a slow writer's entry
    /// that does land first still wins and gets applied.
    pub fn query_to<A: SharedObject>(&self, obj: &LogObject<A>, target: SeqNum) {
        if obj.current() == target {
            return;
        }

        let oid = obj.oid().clone();
        let cache = self.shared.cache(&oid);
        let log_map = self.shared.store.log_map(&oid);

        let mut replica = obj.write();
        let current = replica.current;
        if current >= target {
            // Someone else replayed past the target while we waited for
            // the lock.
            return;
        }
        trace!(%oid, %current, %target, "replaying");

        // Issue the whole range up front to pre-populate the cache.
        let mut reads: Vec<(SeqNum, PendingRead)> = Vec::new();
        let mut seq = current.next();
        loop {
            reads.push((seq, cache.fetch(seq)));
            if seq == target {
                break;
            }
            seq = seq.next();
        }

        // Walk and apply, one position at a time, in increasing order.
        for (seq, mut read) in reads {
            let deadline = Instant::now() + self.shared.config.log_read_timeout;
            let mut entry = read.try_get();
            while entry.is_none() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let slice = self.shared.config.read_poll_interval.min(deadline - now);
                entry = read.wait_until(now + slice);
                if entry.is_none() {
                    // A notification may have been missed; re-poll the
                    // store directly.
                    read = cache.fetch(seq);
                    entry = read.try_get();
                }
            }

            let entry = match entry {
                Some(entry) => entry,
                None => {
                    // Writer presumed dead. Poison the position so every
                    // replica waiting on it can move on; if the writer's
                    // entry landed after all, the conditional write
                    // returns it and we apply it instead.
                    warn!(%oid, %seq, "position unobservable past deadline, poisoning");
                    log_map.put_if_absent(seq, LogEntry::NoOp)
                }
            };

            replica.current = seq;
            if let LogEntry::Payload(bytes) = &entry {
                obj.app().apply(&mut replica.state, seq, bytes);
            }
            trace!(%oid, %seq, "applied");
        }
    }

    // =========================================================================
    // LOG ACCESS & LISTENERS
    // =========================================================================

    /// The log entries in `(after, up_to]`, in order.
    ///
    /// Positions that stay unreadable past the read deadline are skipped
    /// with a warning.
    pub fn log_range(&self, oid: &ObjectId, after: SeqNum, up_to: SeqNum) -> Vec<LogEntry> {
        if after >= up_to {
            return Vec::new();
        }
        let cache = self.shared.cache(oid);
        let mut entries = Vec::new();
        let mut seq = after.next();
        loop {
            let read = cache.fetch(seq);
            match read.wait_until(Instant::now() + self.shared.config.log_read_timeout) {
                Some(entry) => entries.push(entry),
                None => warn!(%oid, %seq, "log entry unreadable, skipping"),
            }
            if seq == up_to {
                break;
            }
            seq = seq.next();
        }
        entries
    }

    /// Registers a listener for log growth on `oid`.
    pub fn add_listener(&self, oid: &ObjectId, listener: Arc<dyn LogListener>) {
        self.shared.cache(oid).add_listener(listener);
    }

    pub fn remove_listener(&self, oid: &ObjectId, listener: &Arc<dyn LogListener>) {
        self.shared.cache(oid).remove_listener(listener);
    }

    // =========================================================================
    // BACKGROUND WORK
    // =========================================================================

    fn schedule_snapshot_check<A: SharedObject>(&self, obj: &Arc<LogObject<A>>) {
        let shared = self.shared.clone();
        let obj = obj.clone();
        self.pool.submit(move || {
            shared.check_snapshot(&obj);
        });
    }
}
