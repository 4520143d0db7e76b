//! Error types for the connection pool.

use thiserror::Error;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur in the connection pool.
///
/// Contention is not an error: acquisition blocks. These variants cover
/// factory failures and caller programming errors the pool can detect.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The connection factory failed to open a handle.
    #[error("failed to open connection to {name}: {message}")]
    Connect {
        /// The data-source name.
        name: String,
        /// Description of the failure.
        message: String,
    },

    /// The calling thread holds a read connection and requested a write
    /// connection for the same source. Waiting for readers to drain
    /// would deadlock on the caller's own read hold.
    #[error("read-to-write upgrade on {name} would self-deadlock")]
    UpgradeDeadlock {
        /// The data-source name.
        name: String,
    },

    /// A maintenance operation was requested by a thread that still
    /// holds a connection for the same source.
    #[error("exclusive maintenance on {name} requested while holding a connection")]
    MaintenanceReentry {
        /// The data-source name.
        name: String,
    },
}

impl PoolError {
    /// Creates a connect error.
    pub fn connect(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connect {
            name: name.into(),
            message: message.into(),
        }
    }
}
