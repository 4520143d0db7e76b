//! Error types for the store crate.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the sync log and queue stores.
///
/// Unreadable journal tails are not errors: replay drops them and the
/// next compaction rewrites the journal from live state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error from the journal backend.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A journal record failed to encode.
    #[error("encode error: {0}")]
    Encode(String),

    /// A queue entry was not found.
    #[error("queue entry not found: id {id}")]
    EntryNotFound {
        /// The entry id that was not found.
        id: u64,
    },
}
