//! # MediSync Store
//!
//! Durable replication bookkeeping for the MediSync client.
//!
//! This crate provides:
//! - An append-only, CRC-framed CBOR journal with memory and file backends
//! - The sync log: per-resource checkpoints and resumable query cursors
//! - The change queue: inbound and outbound entries, partitioned by priority
//!
//! ## Durability model
//!
//! Both stores keep their working state in memory and append one journal
//! record per mutation. Reopening a store replays the journal to rebuild
//! the state; a torn record at the journal tail ends replay (the tail is
//! dropped at the next compaction). Compaction rewrites the journal from
//! the live state once the record count grows past a threshold.
//!
//! ## Key invariants
//!
//! - A checkpoint's sync time advances only when the pull that produced it
//!   has durably enqueued its batches; saving a checkpoint completes the
//!   cursor that produced it in the same journal record.
//! - Queue entries are strictly FIFO within a (kind, priority) partition,
//!   and are removed only on confirmed downstream delivery.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod journal;
mod queue;
mod synclog;

pub use error::{StoreError, StoreResult};
pub use journal::{FileJournal, Journal, JournalBackend, MemoryJournal};
pub use queue::{Operation, Priority, QueueEntry, QueueKind, SyncQueue};
pub use synclog::{now_millis, QueryCursor, SyncCheckpoint, SyncLogStore};
