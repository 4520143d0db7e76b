//! Connection handles and the factory seam.

use crate::error::PoolResult;
use std::sync::Arc;

/// The access mode of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Shared, read-only access.
    ReadOnly,
    /// Exclusive, read-write access.
    ReadWrite,
}

/// Opens raw datastore handles for the pool.
///
/// The pool creates handles lazily on first request for a data-source
/// name and reuses them from the idle list thereafter. Implementations
/// decide what a handle is - a file, an embedded database session, an
/// in-memory fixture for tests.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The raw handle type this factory produces.
    type Handle: Send + Sync + 'static;

    /// Opens a handle to the named data source in the given mode.
    fn connect(&self, source: &str, mode: AccessMode) -> PoolResult<Self::Handle>;

    /// Whether handles for this source survive return to the idle list.
    ///
    /// Non-persistent handles are dropped when their last holder releases
    /// them; persistent handles live until shutdown or maintenance.
    fn is_persistent(&self, _source: &str) -> bool {
        true
    }
}

/// A handle wrapped with its pool bookkeeping.
#[derive(Debug)]
pub struct PooledConnection<H> {
    handle: Arc<H>,
    mode: AccessMode,
    persistent: bool,
}

impl<H> PooledConnection<H> {
    pub(crate) fn new(handle: H, mode: AccessMode, persistent: bool) -> Self {
        Self {
            handle: Arc::new(handle),
            mode,
            persistent,
        }
    }

    /// The access mode this connection was opened with.
    #[must_use]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Whether this connection survives return to the idle list.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// The underlying raw handle.
    #[must_use]
    pub fn handle(&self) -> &H {
        &self.handle
    }
}

impl<H> Clone for PooledConnection<H> {
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
            mode: self.mode,
            persistent: self.persistent,
        }
    }
}

impl<H> std::ops::Deref for PooledConnection<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.handle
    }
}
