//! The change queue: inbound and outbound entries, partitioned by priority.

use crate::error::{StoreError, StoreResult};
use crate::journal::{Journal, JournalBackend};
use crate::synclog::now_millis;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// The replication operation a queue entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// A batch of records fetched from the server.
    Sync,
    /// A locally created record to submit.
    Insert,
    /// A locally modified record to submit.
    Update,
    /// A locally retired record to submit.
    Obsolete,
}

/// The direction a queue entry travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    /// Server to local (fetched changes awaiting persistence).
    Inbound,
    /// Local to server (changes awaiting submission).
    Outbound,
}

/// Priority class of a queue entry. Drain order is Admin, Normal, Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Administrative records, drained first.
    Admin,
    /// Regular clinical records.
    Normal,
    /// Bulk or background records, drained last.
    Low,
}

impl Priority {
    /// All priorities in drain order.
    pub const ALL: [Priority; 3] = [Priority::Admin, Priority::Normal, Priority::Low];
}

/// One durable change record held in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Monotonic entry id, unique across the queue's lifetime.
    pub id: u64,
    /// When the entry was enqueued, in Unix milliseconds.
    pub creation_time: u64,
    /// The resource type the payload belongs to.
    pub resource_type: String,
    /// Opaque serialized record (or record batch).
    pub payload: Vec<u8>,
    /// The replication operation.
    pub operation: Operation,
    /// Direction.
    pub kind: QueueKind,
    /// Priority class.
    pub priority: Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum QueueRecord {
    Enqueued(QueueEntry),
    Removed { id: u64 },
}

#[derive(Debug, Default)]
struct QueueState {
    partitions: HashMap<(QueueKind, Priority), VecDeque<QueueEntry>>,
    next_id: u64,
}

impl QueueState {
    fn apply(&mut self, record: QueueRecord) {
        match record {
            QueueRecord::Enqueued(entry) => {
                self.next_id = self.next_id.max(entry.id + 1);
                self.partitions
                    .entry((entry.kind, entry.priority))
                    .or_default()
                    .push_back(entry);
            }
            QueueRecord::Removed { id } => {
                for partition in self.partitions.values_mut() {
                    partition.retain(|e| e.id != id);
                }
            }
        }
    }

    fn live_records(&self) -> Vec<QueueRecord> {
        let mut entries: Vec<&QueueEntry> = self.partitions.values().flatten().collect();
        entries.sort_by_key(|e| e.id);
        entries
            .into_iter()
            .map(|e| QueueRecord::Enqueued(e.clone()))
            .collect()
    }
}

/// Ordered, durable holding area for inbound and outbound change records.
///
/// Entries are strictly FIFO within each (kind, priority) partition.
/// Enqueue is safe under concurrent producers and atomic with respect to
/// count queries; dequeue is destructive only through [`SyncQueue::remove`]
/// after confirmed downstream delivery. Failed delivery re-enqueues via
/// [`SyncQueue::requeue`].
pub struct SyncQueue {
    state: Mutex<QueueState>,
    journal: Journal<QueueRecord>,
    compact_threshold: usize,
}

impl SyncQueue {
    /// Default journal record count that triggers compaction.
    pub const DEFAULT_COMPACT_THRESHOLD: usize = 8192;

    /// Opens a queue over the given journal backend, replaying state.
    pub fn open(backend: Box<dyn JournalBackend>) -> StoreResult<Self> {
        let (journal, records) = Journal::open(backend)?;
        let mut state = QueueState::default();
        for record in records {
            state.apply(record);
        }
        Ok(Self {
            state: Mutex::new(state),
            journal,
            compact_threshold: Self::DEFAULT_COMPACT_THRESHOLD,
        })
    }

    /// Opens an ephemeral in-memory queue.
    pub fn in_memory() -> Self {
        Self::open(Box::new(crate::journal::MemoryJournal::new()))
            .unwrap_or_else(|_| unreachable!("empty memory journal"))
    }

    /// Sets the compaction threshold.
    #[must_use]
    pub fn with_compact_threshold(mut self, threshold: usize) -> Self {
        self.compact_threshold = threshold;
        self
    }

    /// Enqueues a new entry at the tail of its partition.
    ///
    /// Returns the assigned entry id.
    pub fn enqueue(
        &self,
        kind: QueueKind,
        priority: Priority,
        resource_type: &str,
        operation: Operation,
        payload: Vec<u8>,
    ) -> StoreResult<u64> {
        let mut state = self.state.lock();
        let id = state.next_id;
        let entry = QueueEntry {
            id,
            creation_time: now_millis(),
            resource_type: resource_type.to_string(),
            payload,
            operation,
            kind,
            priority,
        };
        let record = QueueRecord::Enqueued(entry);
        self.journal.append(&record)?;
        state.apply(record);
        Ok(id)
    }

    /// Re-enqueues an entry whose downstream application failed.
    ///
    /// The entry joins its partition tail with a fresh id, keeping ids
    /// strictly monotonic in journal order.
    pub fn requeue(&self, entry: QueueEntry) -> StoreResult<u64> {
        self.enqueue(
            entry.kind,
            entry.priority,
            &entry.resource_type,
            entry.operation,
            entry.payload,
        )
    }

    /// Returns a snapshot of all entries for a direction, in drain order:
    /// priorities Admin, Normal, Low; FIFO within each priority.
    pub fn entries_in_order(&self, kind: QueueKind) -> Vec<QueueEntry> {
        let state = self.state.lock();
        let mut entries = Vec::new();
        for priority in Priority::ALL {
            if let Some(partition) = state.partitions.get(&(kind, priority)) {
                entries.extend(partition.iter().cloned());
            }
        }
        entries
    }

    /// Removes an entry after confirmed downstream delivery.
    pub fn remove(&self, id: u64) -> StoreResult<QueueEntry> {
        let mut state = self.state.lock();
        let entry = state
            .partitions
            .values()
            .flatten()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(StoreError::EntryNotFound { id })?;

        let record = QueueRecord::Removed { id };
        self.journal.append(&record)?;
        state.apply(record);
        self.maybe_compact(&state)?;
        Ok(entry)
    }

    /// Returns the number of entries queued for a direction.
    pub fn count(&self, kind: QueueKind) -> usize {
        let state = self.state.lock();
        Priority::ALL
            .iter()
            .filter_map(|p| state.partitions.get(&(kind, *p)))
            .map(VecDeque::len)
            .sum()
    }

    /// Returns true if no entries are queued for a direction.
    pub fn is_empty(&self, kind: QueueKind) -> bool {
        self.count(kind) == 0
    }

    fn maybe_compact(&self, state: &QueueState) -> StoreResult<()> {
        if self.journal.record_count() > self.compact_threshold {
            tracing::debug!(
                records = self.journal.record_count(),
                "compacting queue journal"
            );
            self.journal.rewrite(&state.live_records())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("inbound", &self.count(QueueKind::Inbound))
            .field("outbound", &self.count(QueueKind::Outbound))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::FileJournal;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn enqueue_n(queue: &SyncQueue, kind: QueueKind, priority: Priority, n: usize) -> Vec<u64> {
        (0..n)
            .map(|i| {
                queue
                    .enqueue(kind, priority, "Patient", Operation::Update, vec![i as u8])
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn fifo_within_partition() {
        let queue = SyncQueue::in_memory();
        let ids = enqueue_n(&queue, QueueKind::Outbound, Priority::Normal, 5);

        let entries = queue.entries_in_order(QueueKind::Outbound);
        let seen: Vec<u64> = entries.iter().map(|e| e.id).collect();
        assert_eq!(seen, ids);
    }

    #[test]
    fn priority_classes_drain_in_order() {
        let queue = SyncQueue::in_memory();
        enqueue_n(&queue, QueueKind::Outbound, Priority::Low, 2);
        enqueue_n(&queue, QueueKind::Outbound, Priority::Admin, 2);
        enqueue_n(&queue, QueueKind::Outbound, Priority::Normal, 2);

        let entries = queue.entries_in_order(QueueKind::Outbound);
        let priorities: Vec<Priority> = entries.iter().map(|e| e.priority).collect();
        assert_eq!(
            priorities,
            vec![
                Priority::Admin,
                Priority::Admin,
                Priority::Normal,
                Priority::Normal,
                Priority::Low,
                Priority::Low
            ]
        );
    }

    #[test]
    fn directions_are_independent() {
        let queue = SyncQueue::in_memory();
        enqueue_n(&queue, QueueKind::Inbound, Priority::Normal, 3);
        enqueue_n(&queue, QueueKind::Outbound, Priority::Normal, 2);

        assert_eq!(queue.count(QueueKind::Inbound), 3);
        assert_eq!(queue.count(QueueKind::Outbound), 2);
    }

    #[test]
    fn remove_is_destructive_and_confirmed() {
        let queue = SyncQueue::in_memory();
        let ids = enqueue_n(&queue, QueueKind::Outbound, Priority::Normal, 3);

        let removed = queue.remove(ids[1]).unwrap();
        assert_eq!(removed.id, ids[1]);
        assert_eq!(queue.count(QueueKind::Outbound), 2);

        assert!(matches!(
            queue.remove(ids[1]),
            Err(StoreError::EntryNotFound { .. })
        ));
    }

    #[test]
    fn requeue_joins_partition_tail() {
        let queue = SyncQueue::in_memory();
        let ids = enqueue_n(&queue, QueueKind::Outbound, Priority::Normal, 3);

        let failed = queue.remove(ids[0]).unwrap();
        let new_id = queue.requeue(failed).unwrap();
        assert!(new_id > ids[2]);

        let order: Vec<u64> = queue
            .entries_in_order(QueueKind::Outbound)
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(order, vec![ids[1], ids[2], new_id]);
    }

    #[test]
    fn queue_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.journal");

        let ids = {
            let queue = SyncQueue::open(Box::new(FileJournal::open(&path).unwrap())).unwrap();
            let ids = enqueue_n(&queue, QueueKind::Outbound, Priority::Normal, 3);
            queue.remove(ids[0]).unwrap();
            ids
        };

        let queue = SyncQueue::open(Box::new(FileJournal::open(&path).unwrap())).unwrap();
        let order: Vec<u64> = queue
            .entries_in_order(QueueKind::Outbound)
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(order, vec![ids[1], ids[2]]);

        // Fresh ids stay monotonic after replay
        let next = queue
            .enqueue(
                QueueKind::Outbound,
                Priority::Normal,
                "Patient",
                Operation::Insert,
                vec![],
            )
            .unwrap();
        assert!(next > ids[2]);
    }

    #[test]
    fn compaction_preserves_order() {
        let queue = SyncQueue::in_memory().with_compact_threshold(4);
        let ids = enqueue_n(&queue, QueueKind::Outbound, Priority::Normal, 6);
        for id in &ids[..4] {
            queue.remove(*id).unwrap();
        }

        let order: Vec<u64> = queue
            .entries_in_order(QueueKind::Outbound)
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(order, vec![ids[4], ids[5]]);
    }

    #[test]
    fn concurrent_enqueue_is_atomic_with_counts() {
        use std::sync::Arc;
        use std::thread;

        let queue = Arc::new(SyncQueue::in_memory());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    queue
                        .enqueue(
                            QueueKind::Outbound,
                            Priority::Normal,
                            "Patient",
                            Operation::Update,
                            vec![],
                        )
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.count(QueueKind::Outbound), 200);
        let entries = queue.entries_in_order(QueueKind::Outbound);
        let mut ids: Vec<u64> = entries.iter().map(|e| e.id).collect();
        let sorted = {
            let mut s = ids.clone();
            s.sort_unstable();
            s
        };
        ids.dedup();
        assert_eq!(ids.len(), 200, "ids must be unique");
        assert_eq!(ids, sorted, "FIFO order matches id order");
    }

    proptest! {
        #[test]
        fn fifo_holds_for_any_interleaving(
            ops in proptest::collection::vec((0u8..3, 0u8..2), 1..60)
        ) {
            let queue = SyncQueue::in_memory();
            for (p, k) in &ops {
                let priority = Priority::ALL[*p as usize];
                let kind = if *k == 0 { QueueKind::Inbound } else { QueueKind::Outbound };
                queue.enqueue(kind, priority, "X", Operation::Sync, vec![]).unwrap();
            }

            for kind in [QueueKind::Inbound, QueueKind::Outbound] {
                let entries = queue.entries_in_order(kind);
                // Priorities appear grouped in drain order
                let ranks: Vec<usize> = entries
                    .iter()
                    .map(|e| Priority::ALL.iter().position(|p| *p == e.priority).unwrap())
                    .collect();
                prop_assert!(ranks.windows(2).all(|w| w[0] <= w[1]));
                // Within a priority, ids are strictly increasing
                for priority in Priority::ALL {
                    let ids: Vec<u64> = entries
                        .iter()
                        .filter(|e| e.priority == priority)
                        .map(|e| e.id)
                        .collect();
                    prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
                }
            }
        }
    }
}
