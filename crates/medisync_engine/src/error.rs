//! Error types and failure classification for the replication engine.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while pulling from or pushing to the upstream.
///
/// Every failure is classified into one of four families, which decides
/// how the engines react: transient network failures are retried only by
/// trigger rescheduling, protocol failures abort the current page or
/// entry, conflicts go through the conflict policy, and local resource
/// failures block the operation that hit them.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The upstream was unreachable or the request timed out. Transient;
    /// the next trigger retries.
    #[error("upstream unreachable: {message}")]
    Network {
        /// Description of the failure.
        message: String,
    },

    /// The upstream answered with something the engine cannot process,
    /// or rejected a well-formed request.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the failure.
        message: String,
    },

    /// A submitted change diverged from the server copy and the active
    /// conflict policy could not resolve it.
    #[error("unresolved conflict for queue entry {entry_id}")]
    Conflict {
        /// The id of the queued entry left unresolved.
        entry_id: u64,
    },

    /// The local datastore failed.
    #[error(transparent)]
    Store(#[from] medisync_store::StoreError),

    /// The connection pool failed.
    #[error(transparent)]
    Pool(#[from] medisync_pool::PoolError),
}

impl EngineError {
    /// Creates a transient network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// True for failures that a later trigger may simply retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}
