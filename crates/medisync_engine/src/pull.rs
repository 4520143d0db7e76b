//! The pull engine: trigger-driven incremental replication from the
//! upstream into the inbound queue.

use crate::config::{EngineConfig, PageLadder};
use crate::datastore::DatastoreFactory;
use crate::error::{EngineError, EngineResult};
use crate::notify::Notifier;
use crate::paging::PageSizer;
use crate::registry::SinkRegistry;
use crate::transport::{AvailabilityProbe, EndpointClass, UpstreamQuery};
use medisync_pool::ConnectionPool;
use medisync_store::{now_millis, Operation, Priority, QueueKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Pulls changed records page by page and enqueues them durably.
///
/// One pull covers one (resource type, filter) pair. Progress is
/// checkpointed: the high-water mark advances only after every batch of
/// the pull is durably enqueued, and an interrupted pull leaves a cursor
/// behind so the next attempt resumes at the page boundary it reached.
pub struct PullEngine {
    pool: Arc<ConnectionPool<DatastoreFactory>>,
    source: String,
    upstream: Arc<dyn UpstreamQuery>,
    probe: Arc<dyn AvailabilityProbe>,
    registry: Arc<SinkRegistry>,
    ladder: PageLadder,
    staleness: Duration,
    notifier: Notifier,
}

impl PullEngine {
    /// Builds a pull engine over the shared pool and collaborators.
    pub fn new(
        pool: Arc<ConnectionPool<DatastoreFactory>>,
        upstream: Arc<dyn UpstreamQuery>,
        probe: Arc<dyn AvailabilityProbe>,
        registry: Arc<SinkRegistry>,
        config: &EngineConfig,
        notifier: Notifier,
    ) -> Self {
        Self {
            pool,
            source: config.source.clone(),
            upstream,
            probe,
            registry,
            ladder: config.ladder.clone(),
            staleness: config.cursor_staleness,
            notifier,
        }
    }

    /// Pulls one resource at normal priority.
    ///
    /// Returns the number of records fetched and enqueued. Failures are
    /// classified, logged and notified; they never propagate to the
    /// caller.
    pub fn pull(
        &self,
        resource_type: &str,
        filter: &str,
        force_full_resync: bool,
        trigger: &str,
    ) -> u64 {
        self.pull_prioritized(
            resource_type,
            filter,
            force_full_resync,
            trigger,
            Priority::Normal,
        )
    }

    /// Pulls one resource, enqueueing its batches at the given priority.
    pub fn pull_prioritized(
        &self,
        resource_type: &str,
        filter: &str,
        force_full_resync: bool,
        trigger: &str,
        priority: Priority,
    ) -> u64 {
        if !self.probe.is_reachable(EndpointClass::Query) {
            tracing::debug!(resource_type, trigger, "upstream unreachable, skipping pull");
            return 0;
        }

        let key = notification_key(resource_type, filter);
        let mut fetched = 0u64;
        match self.run(resource_type, filter, force_full_resync, priority, &mut fetched) {
            Ok(()) => {
                tracing::info!(resource_type, filter, trigger, fetched, "pull complete");
                self.notifier.success(&key);
            }
            Err(e) => {
                tracing::warn!(
                    resource_type,
                    filter,
                    trigger,
                    fetched,
                    transient = e.is_transient(),
                    error = %e,
                    "pull aborted"
                );
                self.notifier.failure(&key, &e.to_string());
            }
        }
        fetched
    }

    /// Deletes the checkpoint, purges dependent local data through the
    /// registry, and runs a forced full pull.
    pub fn resync(&self, resource_type: &str, filter: &str) -> u64 {
        let prepared: EngineResult<()> = (|| {
            {
                let datastore = self.pool.write(&self.source)?;
                let log = datastore.synclog();
                log.delete_checkpoint(resource_type, filter)?;
                if let Some(cursor) = log.active_cursor(resource_type, filter) {
                    log.complete_cursor(cursor.query_id)?;
                }
            }
            self.registry.purge(resource_type)?;
            Ok(())
        })();

        if let Err(e) = prepared {
            tracing::warn!(resource_type, filter, error = %e, "resync preparation failed");
            self.notifier
                .failure(&notification_key(resource_type, filter), &e.to_string());
            return 0;
        }
        tracing::info!(resource_type, filter, "local state purged, pulling from scratch");
        self.pull(resource_type, filter, true, "resync")
    }

    fn run(
        &self,
        resource_type: &str,
        filter: &str,
        force: bool,
        priority: Priority,
        fetched: &mut u64,
    ) -> EngineResult<()> {
        let started = now_millis();

        let (modified_since, resume) = {
            let datastore = self.pool.read(&self.source)?;
            let log = datastore.synclog();
            if force {
                (None, None)
            } else {
                (
                    log.checkpoint(resource_type, filter)
                        .and_then(|cp| cp.last_sync_time),
                    log.active_cursor(resource_type, filter),
                )
            }
        };

        let staleness_ms = self.staleness.as_millis() as u64;
        let (query_id, mut offset, cursor_start) = match resume {
            Some(cursor) if started.saturating_sub(cursor.start_time) <= staleness_ms => {
                tracing::debug!(
                    resource_type,
                    offset = cursor.offset,
                    "resuming interrupted pull"
                );
                (cursor.query_id, cursor.offset, cursor.start_time)
            }
            Some(cursor) => {
                // Too old to trust: the server-side result set has
                // likely shifted under the stored offsets.
                let datastore = self.pool.write(&self.source)?;
                datastore.synclog().complete_cursor(cursor.query_id)?;
                tracing::debug!(resource_type, "stale cursor discarded");
                (Uuid::new_v4(), 0, started)
            }
            None => (Uuid::new_v4(), 0, started),
        };

        let mut sizer = PageSizer::new(self.ladder.clone());
        let mut etag: Option<String> = None;
        let mut first_page = true;

        loop {
            let count = sizer.current();
            let begun = Instant::now();
            let page = self
                .upstream
                .find(resource_type, filter, offset, count, modified_since)?;
            let latency = begun.elapsed();

            if first_page {
                etag = page.etag.clone();
                first_page = false;
            }
            if page.items.is_empty() {
                break;
            }

            let advanced = offset + page.items.len() as u64;
            let payload = encode_batch(&page.items)?;
            {
                let datastore = self.pool.write(&self.source)?;
                datastore.queue().enqueue(
                    QueueKind::Inbound,
                    priority,
                    resource_type,
                    Operation::Sync,
                    payload,
                )?;
                datastore
                    .synclog()
                    .save_cursor(resource_type, filter, query_id, advanced, cursor_start)?;
            }
            *fetched += page.items.len() as u64;
            tracing::debug!(
                resource_type,
                offset,
                size = page.items.len(),
                total = page.total_count,
                "page enqueued"
            );

            offset = advanced;
            if offset >= page.total_count {
                break;
            }
            sizer.observe(latency, page.total_count.saturating_sub(offset));
        }

        // The checkpoint carries the pull's start time so records
        // modified mid-pull are picked up by the next incremental pass.
        let datastore = self.pool.write(&self.source)?;
        datastore
            .synclog()
            .save_checkpoint(resource_type, filter, etag.as_deref(), cursor_start)?;
        Ok(())
    }
}

impl std::fmt::Debug for PullEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullEngine")
            .field("source", &self.source)
            .field("ladder", &self.ladder)
            .finish_non_exhaustive()
    }
}

fn notification_key(resource_type: &str, filter: &str) -> String {
    if filter.is_empty() {
        format!("pull/{resource_type}")
    } else {
        format!("pull/{resource_type}?{filter}")
    }
}

fn encode_batch(items: &[Vec<u8>]) -> EngineResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(&items, &mut payload)
        .map_err(|e| EngineError::protocol(format!("batch encoding failed: {e}")))?;
    Ok(payload)
}
