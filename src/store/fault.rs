//! Fault injection for the cluster store boundary.
//!
//! Simulates failure modes a single-process store cannot otherwise
//! produce:
//! - visibility lag: an entry is durably written but not yet observable
//!   through `get` on this replica (the writer-reserved-but-not-delivered
//!   race the replay path must survive)
//! - dropped change notifications
//! - jittered read latency
//!
//! Only log maps are wrapped; counters and snapshot maps delegate
//! untouched.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use crate::log::seq::SeqNum;
use crate::log::{LogEntry, ObjectId, SnapshotEntry};

use super::{AtomicCounter, ClusterStore, MapEvent, MapListener, SharedMap};

/// Shared switchboard controlling injected faults.
#[derive(Default)]
pub struct FaultPlan {
    /// Positions hidden from `get` until revealed. A hidden position is
    /// still occupied: `put_if_absent` against it returns the real entry.
    hidden: Mutex<HashSet<SeqNum>>,
    /// When true, listeners receive no notifications.
    drop_notifications: Mutex<bool>,
    /// Upper bound for uniformly drawn extra read latency.
    read_jitter: Mutex<Option<Duration>>,
}

impl FaultPlan {
    pub fn new() -> Arc<FaultPlan> {
        Arc::new(FaultPlan::default())
    }

    /// Hides `seq` from reads until [`FaultPlan::reveal`] is called.
    pub fn hide(&self, seq: SeqNum) {
        self.hidden.lock().unwrap().insert(seq);
    }

    pub fn reveal(&self, seq: SeqNum) {
        self.hidden.lock().unwrap().remove(&seq);
    }

    pub fn set_drop_notifications(&self, drop: bool) {
        *self.drop_notifications.lock().unwrap() = drop;
    }

    pub fn set_read_jitter(&self, jitter: Option<Duration>) {
        *self.read_jitter.lock().unwrap() = jitter;
    }

    fn is_hidden(&self, seq: SeqNum) -> bool {
        self.hidden.lock().unwrap().contains(&seq)
    }

    fn notifications_dropped(&self) -> bool {
        *self.drop_notifications.lock().unwrap()
    }

    fn sleep_jitter(&self) {
        let jitter = *self.read_jitter.lock().unwrap();
        if let Some(bound) = jitter {
            if !bound.is_zero() {
                let nanos = rand::thread_rng().gen_range(0..bound.as_nanos().max(1));
                std::thread::sleep(Duration::from_nanos(nanos as u64));
            }
        }
    }
}

/// Log map wrapper applying a [`FaultPlan`].
struct FaultyLogMap {
    inner: Arc<dyn SharedMap<LogEntry>>,
    plan: Arc<FaultPlan>,
}

impl SharedMap<LogEntry> for FaultyLogMap {
    fn get(&self, key: SeqNum) -> Option<LogEntry> {
        self.plan.sleep_jitter();
        if self.plan.is_hidden(key) {
            return None;
        }
        self.inner.get(key)
    }

    fn put(&self, key: SeqNum, value: LogEntry) -> Option<LogEntry> {
        self.inner.put(key, value)
    }

    fn put_if_absent(&self, key: SeqNum, value: LogEntry) -> LogEntry {
        // Conditional writes see the true occupancy; visibility lag only
        // affects reads.
        self.inner.put_if_absent(key, value)
    }

    fn remove(&self, key: SeqNum) -> Option<LogEntry> {
        self.inner.remove(key)
    }

    fn keys(&self) -> Vec<SeqNum> {
        self.inner.keys()
    }

    fn add_listener(&self, listener: Arc<dyn MapListener<LogEntry>>) {
        let plan = self.plan.clone();
        self.inner.add_listener(Arc::new(FilteredListener { listener, plan }));
    }
}

/// Listener wrapper that swallows notifications when the plan says so.
struct FilteredListener {
    listener: Arc<dyn MapListener<LogEntry>>,
    plan: Arc<FaultPlan>,
}

impl MapListener<LogEntry> for FilteredListener {
    fn on_event(&self, event: &MapEvent<LogEntry>) {
        if self.plan.notifications_dropped() {
            return;
        }
        self.listener.on_event(event);
    }
}

/// [`ClusterStore`] wrapper applying a [`FaultPlan`] to log maps.
pub struct FaultyStore {
    inner: Arc<dyn ClusterStore>,
    plan: Arc<FaultPlan>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn ClusterStore>, plan: Arc<FaultPlan>) -> FaultyStore {
        FaultyStore { inner, plan }
    }
}

impl ClusterStore for FaultyStore {
    fn log_map(&self, oid: &ObjectId) -> Arc<dyn SharedMap<LogEntry>> {
        Arc::new(FaultyLogMap {
            inner: self.inner.log_map(oid),
            plan: self.plan.clone(),
        })
    }

    fn snapshot_map(&self, oid: &ObjectId) -> Arc<dyn SharedMap<SnapshotEntry>> {
        self.inner.snapshot_map(oid)
    }

    fn latest_snapshot_counter(&self, oid: &ObjectId) -> Arc<dyn AtomicCounter> {
        self.inner.latest_snapshot_counter(oid)
    }

    fn sequencer_counter(&self, oid: &ObjectId) -> Arc<dyn AtomicCounter> {
        self.inner.sequencer_counter(oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[test]
    fn test_hidden_position_invisible_to_get_but_occupied() {
        let plan = FaultPlan::new();
        let store = FaultyStore::new(Arc::new(MemoryStore::new()), plan.clone());
        let map = store.log_map(&ObjectId::new("x"));
        let key = SeqNum::of(3);

        map.put_if_absent(key, LogEntry::Payload(vec![9]));
        plan.hide(key);

        assert_eq!(None, map.get(key));
        // The position is still occupied for conditional writers.
        assert_eq!(
            LogEntry::Payload(vec![9]),
            map.put_if_absent(key, LogEntry::NoOp)
        );

        plan.reveal(key);
        assert_eq!(Some(LogEntry::Payload(vec![9])), map.get(key));
    }

    #[test]
    fn test_dropped_notifications() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counter(AtomicUsize);
        impl MapListener<LogEntry> for Counter {
            fn on_event(&self, _event: &MapEvent<LogEntry>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let plan = FaultPlan::new();
        let store = FaultyStore::new(Arc::new(MemoryStore::new()), plan.clone());
        let map = store.log_map(&ObjectId::new("x"));

        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        map.add_listener(counter.clone());

        plan.set_drop_notifications(true);
        map.put_if_absent(SeqNum::of(1), LogEntry::NoOp);
        assert_eq!(0, counter.0.load(Ordering::SeqCst));

        plan.set_drop_notifications(false);
        map.put_if_absent(SeqNum::of(2), LogEntry::NoOp);
        assert_eq!(1, counter.0.load(Ordering::SeqCst));
    }
}
