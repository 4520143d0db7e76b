//! The composite local datastore and its pool factory.
//!
//! All engine storage funnels through a [`ConnectionPool`] keyed by
//! data-source name. A handle is the pair of durable stores the engine
//! needs: the sync log and the change queue.

use crate::error::EngineResult;
use medisync_pool::{AccessMode, ConnectionFactory, PoolError, PoolResult};
use medisync_store::{FileJournal, SyncLogStore, SyncQueue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The durable replication state for one data source.
pub struct LocalDatastore {
    synclog: SyncLogStore,
    queue: SyncQueue,
}

impl LocalDatastore {
    /// Opens (or creates) the datastore under a directory, replaying
    /// both journals.
    pub fn open(dir: &Path) -> EngineResult<Self> {
        Ok(Self {
            synclog: SyncLogStore::open(Box::new(FileJournal::open(
                &dir.join("synclog.journal"),
            )?))?,
            queue: SyncQueue::open(Box::new(FileJournal::open(&dir.join("queue.journal"))?))?,
        })
    }

    /// An ephemeral in-memory datastore.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            synclog: SyncLogStore::in_memory(),
            queue: SyncQueue::in_memory(),
        }
    }

    /// The sync log: checkpoints and cursors.
    #[must_use]
    pub fn synclog(&self) -> &SyncLogStore {
        &self.synclog
    }

    /// The change queue.
    #[must_use]
    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }
}

impl std::fmt::Debug for LocalDatastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDatastore")
            .field("synclog", &self.synclog)
            .field("queue", &self.queue)
            .finish()
    }
}

/// Opens [`LocalDatastore`] handles for the pool.
///
/// One datastore instance per source name, shared by every connection
/// to that source; file-backed sources live under `root/<source>/`.
pub struct DatastoreFactory {
    root: Option<PathBuf>,
    opened: Mutex<HashMap<String, Arc<LocalDatastore>>>,
}

impl DatastoreFactory {
    /// A factory that keeps every source on disk under `root`.
    pub fn file(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            opened: Mutex::new(HashMap::new()),
        }
    }

    /// A factory producing ephemeral in-memory sources, for tests.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            root: None,
            opened: Mutex::new(HashMap::new()),
        }
    }
}

impl ConnectionFactory for DatastoreFactory {
    type Handle = Arc<LocalDatastore>;

    fn connect(&self, source: &str, _mode: AccessMode) -> PoolResult<Arc<LocalDatastore>> {
        let mut opened = self.opened.lock();
        if let Some(datastore) = opened.get(source) {
            return Ok(Arc::clone(datastore));
        }
        let datastore = match &self.root {
            Some(root) => Arc::new(
                LocalDatastore::open(&root.join(source))
                    .map_err(|e| PoolError::connect(source, e.to_string()))?,
            ),
            None => Arc::new(LocalDatastore::in_memory()),
        };
        opened.insert(source.to_string(), Arc::clone(&datastore));
        Ok(datastore)
    }
}

impl std::fmt::Debug for DatastoreFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatastoreFactory")
            .field("root", &self.root)
            .field("opened", &self.opened.lock().len())
            .finish()
    }
}
