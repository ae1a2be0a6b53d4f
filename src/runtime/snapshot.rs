//! Snapshot creation and log trimming.
//!
//! Runs on the background worker pool, never inline with a caller's
//! update. Holding only the object's read lock: decide whether the latest
//! snapshot is stale, serialize a new one, publish it, and advance the
//! latest-snapshot pointer monotonically. Afterwards, retire excess
//! snapshots and trim the log behind the oldest retained one.

use tracing::{debug, info, trace};

use crate::log::seq::SeqNum;
use crate::log::{ObjectId, SnapshotEntry};
use crate::object::{LogObject, SharedObject};

use super::RuntimeShared;

impl RuntimeShared {
    /// Creates a snapshot of `obj` if the latest one is old enough, then
    /// enforces the snapshot retention bound.
    pub(crate) fn check_snapshot<A: SharedObject>(&self, obj: &LogObject<A>) {
        let oid = obj.oid().clone();
        trace!(%oid, "checking whether a new snapshot is needed");

        let latest_counter = self.store.latest_snapshot_counter(&oid);
        let snapshot_map = self.store.snapshot_map(&oid);

        {
            let replica = obj.read();
            let current = replica.current;
            let latest = SeqNum::of(latest_counter.get());

            if latest.distance(current) < self.config.snapshot_interval {
                trace!(%oid, %current, %latest, "skipping snapshot, too recent");
                return;
            }

            let payload = obj.app().snapshot(&replica.state);
            snapshot_map.put(current, SnapshotEntry::Payload(payload));
            info!(%oid, %current, "created snapshot");

            // Monotone advance: never regress if a newer snapshot was
            // published concurrently.
            latest_counter.update(&move |existing| {
                if SeqNum::of(existing) < current {
                    current.value()
                } else {
                    existing
                }
            });
        }

        self.trim(&oid);
    }

    /// Deletes excess snapshots and the log entries they cover.
    ///
    /// Keeps the newest `max_snapshots` snapshots; everything older is
    /// deleted, and log entries below the oldest retained snapshot are
    /// removed walking backward until deletions stop succeeding (i.e.
    /// until reaching the already-trimmed region).
    fn trim(&self, oid: &ObjectId) {
        let snapshot_map = self.store.snapshot_map(oid);

        let mut snapshots = snapshot_map.keys();
        if snapshots.len() <= self.config.max_snapshots {
            return;
        }
        snapshots.sort();

        let excess = snapshots.len() - self.config.max_snapshots;
        let (expired, retained) = snapshots.split_at(excess);
        let oldest_retained = retained[0];

        for seq in expired {
            debug!(%oid, %seq, "removed snapshot");
            snapshot_map.remove(*seq);
        }

        let log_map = self.store.log_map(oid);
        debug!(%oid, %oldest_retained, "trimming log below oldest retained snapshot");
        let mut seq = oldest_retained;
        while !seq.is_initial() {
            seq = seq.prev();
            if seq.is_initial() || log_map.remove(seq).is_none() {
                break;
            }
        }
        debug!(%oid, %seq, "trimmed log down to");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogEntry;
    use crate::runtime::{LogRuntime, RuntimeConfig};
    use crate::store::memory::MemoryStore;
    use crate::store::ClusterStore;
    use std::sync::Arc;

    fn small_config() -> RuntimeConfig {
        RuntimeConfig {
            snapshot_interval: 2,
            max_snapshots: 2,
            ..RuntimeConfig::default()
        }
    }

    /// Minimal shared object for snapshot tests: a byte blob set wholesale
    /// by each entry.
    struct Blob;
    impl SharedObject for Blob {
        type State = Vec<u8>;
        type RestoreError = std::io::Error;

        fn initial(&self) -> Vec<u8> {
            Vec::new()
        }
        fn is_applicable(&self, _state: &Vec<u8>, _seq: SeqNum, _payload: &[u8]) -> bool {
            true
        }
        fn apply(&self, state: &mut Vec<u8>, _seq: SeqNum, payload: &[u8]) {
            *state = payload.to_vec();
        }
        fn snapshot(&self, state: &Vec<u8>) -> Vec<u8> {
            state.clone()
        }
        fn restore(&self, payload: &[u8]) -> Result<Vec<u8>, Self::RestoreError> {
            Ok(payload.to_vec())
        }
    }

    #[test]
    fn test_snapshot_skipped_when_recent() {
        let store = Arc::new(MemoryStore::new());
        let runtime = LogRuntime::with_config(store.clone(), small_config());
        let obj = runtime.open(Blob, "blob").unwrap();

        runtime.update(&obj, vec![1], false).unwrap();
        // current=1, latest=0, gap 1 < snapshot_interval 2
        runtime.shared.check_snapshot(&obj);
        assert!(store.snapshot_map(obj.oid()).keys().is_empty());
    }

    #[test]
    fn test_snapshot_created_and_pointer_advanced() {
        let store = Arc::new(MemoryStore::new());
        let runtime = LogRuntime::with_config(store.clone(), small_config());
        let obj = runtime.open(Blob, "blob").unwrap();

        for byte in 0..3u8 {
            runtime.update(&obj, vec![byte], false).unwrap();
        }
        runtime.shared.check_snapshot(&obj);

        let current = obj.current();
        assert_eq!(current, runtime.latest_snapshot(obj.oid()));
        assert_eq!(
            Some(SnapshotEntry::Payload(vec![2])),
            store.snapshot_map(obj.oid()).get(current)
        );
    }

    #[test]
    fn test_pointer_never_regresses() {
        let store = Arc::new(MemoryStore::new());
        let runtime = LogRuntime::with_config(store.clone(), small_config());
        let oid = crate::log::ObjectId::new("blob");

        let counter = store.latest_snapshot_counter(&oid);
        counter.update(&|_| 100);

        let obj = runtime.open_at(Blob, "blob", SeqNum::INITIAL).unwrap();
        for byte in 0..3u8 {
            runtime.update(&obj, vec![byte], false).unwrap();
        }
        runtime.shared.check_snapshot(&obj);

        // current is 3, far below the concurrently published 100.
        assert_eq!(SeqNum::of(100), runtime.latest_snapshot(&oid));
    }

    #[test]
    fn test_retention_and_trim() {
        let store = Arc::new(MemoryStore::new());
        let runtime = LogRuntime::with_config(store.clone(), small_config());
        let obj = runtime.open(Blob, "blob").unwrap();

        // Build history with a snapshot forced every few entries.
        for round in 0..5u8 {
            for byte in 0..3u8 {
                runtime.update(&obj, vec![round, byte], false).unwrap();
            }
            runtime.shared.check_snapshot(&obj);
        }

        let snapshot_map = store.snapshot_map(obj.oid());
        let mut snapshots = snapshot_map.keys();
        snapshots.sort();
        assert_eq!(2, snapshots.len(), "retention bound enforced");

        let oldest_retained = snapshots[0];
        let log_map = store.log_map(obj.oid());
        for seq in log_map.keys() {
            assert!(
                seq >= oldest_retained,
                "entry {} should have been trimmed (oldest retained {})",
                seq,
                oldest_retained
            );
        }
        // Entries at and above the oldest retained snapshot survive.
        assert!(log_map.get(obj.current()).is_some());
        assert!(matches!(
            log_map.get(obj.current()),
            Some(LogEntry::Payload(_))
        ));
    }
}
