//! Per-object near-cache of recently observed log entries.
//!
//! Populated by store change notifications, fetched lazily from the log
//! map otherwise. A fetch returns a [`PendingRead`] slot: already complete
//! when the entry is cached or present in the store, completed later by a
//! notification when a writer has reserved the position but its value has
//! not reached this replica yet. Also dispatches "log grew" events to
//! registered [`LogListener`]s so non-writing replicas can advance
//! asynchronously.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Instant;

use crate::log::seq::SeqNum;
use crate::log::{LogEntry, ObjectId};
use crate::store::{MapEvent, MapListener, SharedMap};

/// Observes log growth for one object.
///
/// Invoked on the store's notification context: implementations must be
/// fast and must not call back into the runtime.
pub trait LogListener: Send + Sync {
    fn log_added(&self, seq: SeqNum);
}

// =============================================================================
// READ SLOTS
// =============================================================================

struct ReadSlot {
    cell: Mutex<Option<LogEntry>>,
    cond: Condvar,
}

impl ReadSlot {
    fn empty() -> Arc<ReadSlot> {
        Arc::new(ReadSlot {
            cell: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn complete(&self, entry: LogEntry) {
        let mut cell = self.cell.lock().unwrap();
        if cell.is_none() {
            *cell = Some(entry);
            self.cond.notify_all();
        }
    }

    fn is_complete(&self) -> bool {
        self.cell.lock().unwrap().is_some()
    }
}

/// Handle on one in-flight log read.
///
/// Multiple pending reads can be outstanding at once; each completes
/// independently when its entry becomes observable.
pub struct PendingRead {
    slot: Arc<ReadSlot>,
}

impl PendingRead {
    /// The entry, if already observable.
    pub fn try_get(&self) -> Option<LogEntry> {
        self.slot.cell.lock().unwrap().clone()
    }

    /// Blocks until the entry becomes observable or `deadline` passes.
    pub fn wait_until(&self, deadline: Instant) -> Option<LogEntry> {
        let mut cell = self.slot.cell.lock().unwrap();
        loop {
            if let Some(entry) = cell.as_ref() {
                return Some(entry.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, timeout) = self
                .slot
                .cond
                .wait_timeout(cell, deadline - now)
                .unwrap();
            cell = next;
            if timeout.timed_out() && cell.is_none() {
                return None;
            }
        }
    }
}

// =============================================================================
// LOG CACHE
// =============================================================================

/// Near-cache for one object's shared log.
pub struct LogCache {
    oid: ObjectId,
    map: Arc<dyn SharedMap<LogEntry>>,
    slots: Mutex<BTreeMap<SeqNum, Arc<ReadSlot>>>,
    capacity: usize,
    listeners: RwLock<Vec<Arc<dyn LogListener>>>,
    last_observed: Mutex<SeqNum>,
}

impl LogCache {
    /// Creates the cache and hooks it to the log map's notification
    /// stream.
    pub fn new(
        oid: ObjectId,
        map: Arc<dyn SharedMap<LogEntry>>,
        capacity: usize,
    ) -> Arc<LogCache> {
        let cache = Arc::new(LogCache {
            oid,
            map: map.clone(),
            slots: Mutex::new(BTreeMap::new()),
            capacity,
            listeners: RwLock::new(Vec::new()),
            last_observed: Mutex::new(SeqNum::INITIAL),
        });
        map.add_listener(Arc::new(CacheFill {
            cache: Arc::downgrade(&cache),
        }));
        cache
    }

    pub fn oid(&self) -> &ObjectId {
        &self.oid
    }

    /// Highest log position observed through notifications.
    pub fn last_observed(&self) -> SeqNum {
        *self.last_observed.lock().unwrap()
    }

    /// Issues a read for `seq`.
    ///
    /// Checks the cache, then reads through to the store; if the entry is
    /// not observable yet the returned slot stays pending and completes on
    /// a later notification (or a later re-issued fetch).
    pub fn fetch(&self, seq: SeqNum) -> PendingRead {
        let slot = self.slot_for(seq);
        if !slot.is_complete() {
            if let Some(entry) = self.map.get(seq) {
                slot.complete(entry);
            }
        }
        PendingRead { slot }
    }

    pub fn add_listener(&self, listener: Arc<dyn LogListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn LogListener>) {
        self.listeners
            .write()
            .unwrap()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    fn slot_for(&self, seq: SeqNum) -> Arc<ReadSlot> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.entry(seq).or_insert_with(ReadSlot::empty).clone();
        // Oldest positions go first. An evicted waiter still holds its
        // slot and re-polls the store on timeout.
        while slots.len() > self.capacity {
            let oldest = *slots.keys().next().unwrap();
            slots.remove(&oldest);
        }
        slot
    }

    fn on_event(&self, event: &MapEvent<LogEntry>) {
        match event {
            MapEvent::Added { key, value } => {
                self.slot_for(*key).complete(value.clone());
                {
                    let mut last = self.last_observed.lock().unwrap();
                    if *key > *last {
                        *last = *key;
                    }
                }
                let listeners = self.listeners.read().unwrap().clone();
                for listener in &listeners {
                    listener.log_added(*key);
                }
            }
            MapEvent::Updated { key, value } => {
                self.slot_for(*key).complete(value.clone());
            }
            MapEvent::Removed { key } => {
                self.slots.lock().unwrap().remove(key);
            }
        }
    }
}

/// Adapter registered with the log map; weak so the map does not keep the
/// cache alive.
struct CacheFill {
    cache: Weak<LogCache>,
}

impl MapListener<LogEntry> for CacheFill {
    fn on_event(&self, event: &MapEvent<LogEntry>) {
        if let Some(cache) = self.cache.upgrade() {
            cache.on_event(event);
        }
    }
}
