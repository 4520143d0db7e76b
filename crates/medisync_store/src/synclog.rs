//! The sync log: per-resource checkpoints and resumable query cursors.

use crate::error::StoreResult;
use crate::journal::{Journal, JournalBackend};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Returns the current wall-clock time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The persisted high-water mark for one (resource type, filter) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    /// The resource type this checkpoint tracks.
    pub resource_type: String,
    /// The filter expression this checkpoint tracks.
    pub filter: String,
    /// Time of the last completed pull, in Unix milliseconds.
    pub last_sync_time: Option<u64>,
    /// Opaque server version token from the last completed pull.
    pub last_etag: Option<String>,
}

/// Transient progress through a single multi-page pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCursor {
    /// Opaque correlation token for the in-flight query.
    pub query_id: Uuid,
    /// Offset of the next page to fetch.
    pub offset: u64,
    /// When the pull started, in Unix milliseconds.
    pub start_time: u64,
}

/// One journal record per sync log mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogRecord {
    /// A checkpoint was saved. On replay this also completes any cursor
    /// for the same key, so checkpoint advance and cursor completion are
    /// a single durable event.
    Checkpoint {
        resource_type: String,
        filter: String,
        etag: Option<String>,
        timestamp: u64,
    },
    CheckpointDeleted {
        resource_type: String,
        filter: String,
    },
    Cursor {
        resource_type: String,
        filter: String,
        query_id: Uuid,
        offset: u64,
        start_time: u64,
    },
    CursorCompleted {
        query_id: Uuid,
    },
    PushTime {
        timestamp: u64,
    },
    Reset,
}

#[derive(Debug, Default)]
struct LogState {
    checkpoints: HashMap<(String, String), SyncCheckpoint>,
    cursors: HashMap<(String, String), QueryCursor>,
    last_push_time: Option<u64>,
}

impl LogState {
    fn apply(&mut self, record: LogRecord) {
        match record {
            LogRecord::Checkpoint {
                resource_type,
                filter,
                etag,
                timestamp,
            } => {
                let key = (resource_type.clone(), filter.clone());
                self.cursors.remove(&key);
                self.checkpoints.insert(
                    key,
                    SyncCheckpoint {
                        resource_type,
                        filter,
                        last_sync_time: Some(timestamp),
                        last_etag: etag,
                    },
                );
            }
            LogRecord::CheckpointDeleted {
                resource_type,
                filter,
            } => {
                self.checkpoints.remove(&(resource_type, filter));
            }
            LogRecord::Cursor {
                resource_type,
                filter,
                query_id,
                offset,
                start_time,
            } => {
                self.cursors.insert(
                    (resource_type, filter),
                    QueryCursor {
                        query_id,
                        offset,
                        start_time,
                    },
                );
            }
            LogRecord::CursorCompleted { query_id } => {
                self.cursors.retain(|_, c| c.query_id != query_id);
            }
            LogRecord::PushTime { timestamp } => {
                self.last_push_time = Some(timestamp);
            }
            LogRecord::Reset => {
                self.checkpoints.clear();
                self.cursors.clear();
                self.last_push_time = None;
            }
        }
    }

    fn live_records(&self) -> Vec<LogRecord> {
        let mut records = Vec::new();
        for cp in self.checkpoints.values() {
            if let Some(timestamp) = cp.last_sync_time {
                records.push(LogRecord::Checkpoint {
                    resource_type: cp.resource_type.clone(),
                    filter: cp.filter.clone(),
                    etag: cp.last_etag.clone(),
                    timestamp,
                });
            }
        }
        for ((resource_type, filter), cursor) in &self.cursors {
            records.push(LogRecord::Cursor {
                resource_type: resource_type.clone(),
                filter: filter.clone(),
                query_id: cursor.query_id,
                offset: cursor.offset,
                start_time: cursor.start_time,
            });
        }
        if let Some(timestamp) = self.last_push_time {
            records.push(LogRecord::PushTime { timestamp });
        }
        records
    }
}

/// Durable record of per-resource synchronization state.
///
/// Keyed by `(resource_type, filter)`. Working state lives in memory and
/// every mutation appends one journal record; reopening the store replays
/// the journal. The journal is compacted from live state once it grows
/// past the compaction threshold.
pub struct SyncLogStore {
    state: Mutex<LogState>,
    journal: Journal<LogRecord>,
    compact_threshold: usize,
}

impl SyncLogStore {
    /// Default journal record count that triggers compaction.
    pub const DEFAULT_COMPACT_THRESHOLD: usize = 4096;

    /// Opens a sync log over the given journal backend, replaying state.
    pub fn open(backend: Box<dyn JournalBackend>) -> StoreResult<Self> {
        let (journal, records) = Journal::open(backend)?;
        let mut state = LogState::default();
        for record in records {
            state.apply(record);
        }
        Ok(Self {
            state: Mutex::new(state),
            journal,
            compact_threshold: Self::DEFAULT_COMPACT_THRESHOLD,
        })
    }

    /// Opens an ephemeral in-memory sync log.
    pub fn in_memory() -> Self {
        // MemoryJournal::open over an empty backend cannot fail
        Self::open(Box::new(crate::journal::MemoryJournal::new()))
            .unwrap_or_else(|_| unreachable!("empty memory journal"))
    }

    /// Sets the compaction threshold.
    #[must_use]
    pub fn with_compact_threshold(mut self, threshold: usize) -> Self {
        self.compact_threshold = threshold;
        self
    }

    /// Looks up the checkpoint for a (resource type, filter) pair.
    pub fn checkpoint(&self, resource_type: &str, filter: &str) -> Option<SyncCheckpoint> {
        self.state
            .lock()
            .checkpoints
            .get(&(resource_type.to_string(), filter.to_string()))
            .cloned()
    }

    /// Saves a checkpoint, completing any cursor for the same key.
    ///
    /// The checkpoint advance and cursor completion are one journal
    /// record, so a crash can never observe an advanced checkpoint with
    /// its producing cursor still live.
    pub fn save_checkpoint(
        &self,
        resource_type: &str,
        filter: &str,
        etag: Option<&str>,
        timestamp: u64,
    ) -> StoreResult<()> {
        let record = LogRecord::Checkpoint {
            resource_type: resource_type.to_string(),
            filter: filter.to_string(),
            etag: etag.map(String::from),
            timestamp,
        };
        let mut state = self.state.lock();
        self.journal.append(&record)?;
        state.apply(record);
        self.maybe_compact(&state)
    }

    /// Deletes the checkpoint for a (resource type, filter) pair.
    pub fn delete_checkpoint(&self, resource_type: &str, filter: &str) -> StoreResult<()> {
        let record = LogRecord::CheckpointDeleted {
            resource_type: resource_type.to_string(),
            filter: filter.to_string(),
        };
        let mut state = self.state.lock();
        self.journal.append(&record)?;
        state.apply(record);
        Ok(())
    }

    /// Returns the in-flight cursor for a (resource type, filter) pair.
    pub fn active_cursor(&self, resource_type: &str, filter: &str) -> Option<QueryCursor> {
        self.state
            .lock()
            .cursors
            .get(&(resource_type.to_string(), filter.to_string()))
            .cloned()
    }

    /// Saves (or advances) the cursor for an in-flight pull.
    pub fn save_cursor(
        &self,
        resource_type: &str,
        filter: &str,
        query_id: Uuid,
        offset: u64,
        start_time: u64,
    ) -> StoreResult<()> {
        let record = LogRecord::Cursor {
            resource_type: resource_type.to_string(),
            filter: filter.to_string(),
            query_id,
            offset,
            start_time,
        };
        let mut state = self.state.lock();
        self.journal.append(&record)?;
        state.apply(record);
        Ok(())
    }

    /// Completes (discards) the cursor with the given query id.
    pub fn complete_cursor(&self, query_id: Uuid) -> StoreResult<()> {
        let record = LogRecord::CursorCompleted { query_id };
        let mut state = self.state.lock();
        self.journal.append(&record)?;
        state.apply(record);
        Ok(())
    }

    /// Lists all checkpoints.
    pub fn list_all(&self) -> Vec<SyncCheckpoint> {
        let mut all: Vec<_> = self.state.lock().checkpoints.values().cloned().collect();
        all.sort_by(|a, b| {
            (&a.resource_type, &a.filter).cmp(&(&b.resource_type, &b.filter))
        });
        all
    }

    /// Purges all checkpoints and cursors ("resync all").
    pub fn reset_all(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.apply(LogRecord::Reset);
        self.journal.rewrite(&state.live_records())
    }

    /// Records the completion time of a fully drained push.
    pub fn record_push_time(&self, timestamp: u64) -> StoreResult<()> {
        let record = LogRecord::PushTime { timestamp };
        let mut state = self.state.lock();
        self.journal.append(&record)?;
        state.apply(record);
        Ok(())
    }

    /// Returns the completion time of the last fully drained push.
    pub fn last_push_time(&self) -> Option<u64> {
        self.state.lock().last_push_time
    }

    fn maybe_compact(&self, state: &LogState) -> StoreResult<()> {
        if self.journal.record_count() > self.compact_threshold {
            tracing::debug!(
                records = self.journal.record_count(),
                "compacting sync log journal"
            );
            self.journal.rewrite(&state.live_records())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SyncLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SyncLogStore")
            .field("checkpoints", &state.checkpoints.len())
            .field("cursors", &state.cursors.len())
            .finish_non_exhaustive()
    }
}
