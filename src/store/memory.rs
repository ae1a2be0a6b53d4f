//! In-process stand-in for the cluster store.
//!
//! Strongly consistent by construction (one process, plain locks), with the
//! same per-key atomicity and change-notification contract a real cluster
//! store provides. Used by tests and the demo harness.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::log::seq::SeqNum;
use crate::log::{LogEntry, ObjectId, SnapshotEntry};

use super::{
    AtomicCounter, ClusterStore, MapEvent, MapListener, SharedMap, LATEST_SNAPSHOT_PREFIX,
    LOG_PREFIX, SEQUENCER_PREFIX, SNAPSHOT_PREFIX,
};

// =============================================================================
// MEMORY MAP
// =============================================================================

/// In-memory [`SharedMap`].
pub struct MemoryMap<V> {
    entries: Mutex<HashMap<SeqNum, V>>,
    listeners: RwLock<Vec<Arc<dyn MapListener<V>>>>,
}

impl<V: Clone> MemoryMap<V> {
    pub fn new() -> MemoryMap<V> {
        MemoryMap {
            entries: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    fn notify(&self, event: MapEvent<V>) {
        // Listener list is copied out so a listener may not deadlock against
        // registration; the entries lock is already released by our callers.
        let listeners = self.listeners.read().unwrap().clone();
        for listener in &listeners {
            listener.on_event(&event);
        }
    }
}

impl<V: Clone> Default for MemoryMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> SharedMap<V> for MemoryMap<V> {
    fn get(&self, key: SeqNum) -> Option<V> {
        self.entries.lock().unwrap().get(&key).cloned()
    }

    fn put(&self, key: SeqNum, value: V) -> Option<V> {
        let previous = self
            .entries
            .lock()
            .unwrap()
            .insert(key, value.clone());
        match previous {
            Some(_) => self.notify(MapEvent::Updated { key, value }),
            None => self.notify(MapEvent::Added { key, value }),
        }
        previous
    }

    fn put_if_absent(&self, key: SeqNum, value: V) -> V {
        let stored = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(&key) {
                Some(existing) => return existing.clone(),
                None => {
                    entries.insert(key, value.clone());
                    value
                }
            }
        };
        self.notify(MapEvent::Added {
            key,
            value: stored.clone(),
        });
        stored
    }

    fn remove(&self, key: SeqNum) -> Option<V> {
        let removed = self.entries.lock().unwrap().remove(&key);
        if removed.is_some() {
            self.notify(MapEvent::Removed { key });
        }
        removed
    }

    fn keys(&self) -> Vec<SeqNum> {
        self.entries.lock().unwrap().keys().copied().collect()
    }

    fn add_listener(&self, listener: Arc<dyn MapListener<V>>) {
        self.listeners.write().unwrap().push(listener);
    }
}

// =============================================================================
// MEMORY COUNTER
// =============================================================================

/// In-memory [`AtomicCounter`].
pub struct MemoryCounter {
    value: AtomicU64,
}

impl MemoryCounter {
    pub fn new() -> MemoryCounter {
        MemoryCounter {
            value: AtomicU64::new(0),
        }
    }
}

impl Default for MemoryCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicCounter for MemoryCounter {
    fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn update(&self, f: &dyn Fn(u64) -> u64) -> u64 {
        let mut current = self.value.load(Ordering::SeqCst);
        loop {
            let updated = f(current);
            match self.value.compare_exchange(
                current,
                updated,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return updated,
                Err(observed) => current = observed,
            }
        }
    }
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// In-process [`ClusterStore`] backed by named maps and counters.
///
/// Handles for the same namespace name always address the same underlying
/// map, as a cluster store would.
pub struct MemoryStore {
    log_maps: Mutex<HashMap<String, Arc<MemoryMap<LogEntry>>>>,
    snapshot_maps: Mutex<HashMap<String, Arc<MemoryMap<SnapshotEntry>>>>,
    counters: Mutex<HashMap<String, Arc<MemoryCounter>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            log_maps: Mutex::new(HashMap::new()),
            snapshot_maps: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn counter(&self, name: String) -> Arc<MemoryCounter> {
        self.counters
            .lock()
            .unwrap()
            .entry(name)
            .or_insert_with(|| Arc::new(MemoryCounter::new()))
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStore for MemoryStore {
    fn log_map(&self, oid: &ObjectId) -> Arc<dyn SharedMap<LogEntry>> {
        self.log_maps
            .lock()
            .unwrap()
            .entry(format!("{}{}", LOG_PREFIX, oid.name()))
            .or_insert_with(|| Arc::new(MemoryMap::new()))
            .clone()
    }

    fn snapshot_map(&self, oid: &ObjectId) -> Arc<dyn SharedMap<SnapshotEntry>> {
        self.snapshot_maps
            .lock()
            .unwrap()
            .entry(format!("{}{}", SNAPSHOT_PREFIX, oid.name()))
            .or_insert_with(|| Arc::new(MemoryMap::new()))
            .clone()
    }

    fn latest_snapshot_counter(&self, oid: &ObjectId) -> Arc<dyn AtomicCounter> {
        self.counter(format!("{}{}", LATEST_SNAPSHOT_PREFIX, oid.name()))
    }

    fn sequencer_counter(&self, oid: &ObjectId) -> Arc<dyn AtomicCounter> {
        self.counter(format!("{}{}", SEQUENCER_PREFIX, oid.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_put_if_absent_single_winner() {
        let map: MemoryMap<LogEntry> = MemoryMap::new();
        let key = SeqNum::of(1);

        let first = map.put_if_absent(key, LogEntry::Payload(vec![1]));
        assert_eq!(LogEntry::Payload(vec![1]), first);

        // Second writer observes the stored value, not its own.
        let second = map.put_if_absent(key, LogEntry::Payload(vec![2]));
        assert_eq!(LogEntry::Payload(vec![1]), second);
        assert_eq!(Some(LogEntry::Payload(vec![1])), map.get(key));
    }

    #[test]
    fn test_put_if_absent_concurrent_single_winner() {
        let map: Arc<MemoryMap<LogEntry>> = Arc::new(MemoryMap::new());
        let key = SeqNum::of(7);

        let mut handles = Vec::new();
        for writer in 0..8u8 {
            let map = map.clone();
            handles.push(std::thread::spawn(move || {
                map.put_if_absent(key, LogEntry::Payload(vec![writer]))
            }));
        }

        let observed: Vec<LogEntry> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        // Every racer observed the same stored value.
        let stored = map.get(key).unwrap();
        assert!(observed.iter().all(|entry| *entry == stored));
    }

    #[test]
    fn test_remove_and_keys() {
        let map: MemoryMap<LogEntry> = MemoryMap::new();
        map.put(SeqNum::of(1), LogEntry::NoOp);
        map.put(SeqNum::of(2), LogEntry::NoOp);

        let mut keys = map.keys();
        keys.sort();
        assert_eq!(vec![SeqNum::of(1), SeqNum::of(2)], keys);

        assert_eq!(Some(LogEntry::NoOp), map.remove(SeqNum::of(1)));
        assert_eq!(None, map.remove(SeqNum::of(1)));
        assert_eq!(vec![SeqNum::of(2)], map.keys());
    }

    #[test]
    fn test_listener_sees_added_and_removed() {
        struct Recorder {
            added: AtomicUsize,
            removed: AtomicUsize,
        }
        impl MapListener<LogEntry> for Recorder {
            fn on_event(&self, event: &MapEvent<LogEntry>) {
                match event {
                    MapEvent::Added { .. } => self.added.fetch_add(1, Ordering::SeqCst),
                    MapEvent::Removed { .. } => self.removed.fetch_add(1, Ordering::SeqCst),
                    MapEvent::Updated { .. } => 0,
                };
            }
        }

        let map: MemoryMap<LogEntry> = MemoryMap::new();
        let recorder = Arc::new(Recorder {
            added: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
        });
        map.add_listener(recorder.clone());

        map.put_if_absent(SeqNum::of(1), LogEntry::NoOp);
        map.put_if_absent(SeqNum::of(1), LogEntry::NoOp); // lost race, no event
        map.remove(SeqNum::of(1));

        assert_eq!(1, recorder.added.load(Ordering::SeqCst));
        assert_eq!(1, recorder.removed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_counter_update_is_atomic() {
        let counter = MemoryCounter::new();
        assert_eq!(1, counter.increment());
        assert_eq!(2, counter.increment());

        // Monotone update: only advances.
        let stored = counter.update(&|current| current.max(10));
        assert_eq!(10, stored);
        let stored = counter.update(&|current| current.max(5));
        assert_eq!(10, stored);
    }

    #[test]
    fn test_store_hands_out_same_namespace() {
        let store = MemoryStore::new();
        let oid = ObjectId::new("x");

        store.log_map(&oid).put(SeqNum::of(1), LogEntry::NoOp);
        assert_eq!(Some(LogEntry::NoOp), store.log_map(&oid).get(SeqNum::of(1)));

        // Different object, different namespace.
        assert_eq!(None, store.log_map(&ObjectId::new("y")).get(SeqNum::of(1)));
    }
}
