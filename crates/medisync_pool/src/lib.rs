//! # MediSync Pool
//!
//! Connection pool for the embedded local datastore.
//!
//! Embedded single-file datastores allow either multiple readers or one
//! writer at the process level, never both. This crate enforces that
//! contract across all synchronization and application threads:
//!
//! - Many read-only connections per data-source name, handed out while
//!   the source's gate is open
//! - At most one read-write connection, which closes the gate and waits
//!   for live readers to drain before it is entered
//! - Re-entrancy: a thread already holding a connection for a source
//!   reuses it instead of deadlocking itself
//! - Idle handles return to a free list rather than being closed
//! - An exclusive maintenance path (backup, compaction, re-keying) that
//!   waits for a quiescent source and blocks new acquisitions
//!
//! Acquisition blocks without timeout by design; callers needing bounded
//! waits wrap the calls themselves. The pool is an explicitly constructed
//! object passed to its users - there is no ambient singleton.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod connection;
mod error;
mod pool;

pub use connection::{AccessMode, ConnectionFactory, PooledConnection};
pub use error::{PoolError, PoolResult};
pub use pool::{ConnectionPool, ReadGuard, WriteGuard};
