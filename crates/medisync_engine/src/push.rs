//! The push engine: drains the outbound queue to the upstream.

use crate::config::EngineConfig;
use crate::datastore::DatastoreFactory;
use crate::error::{EngineError, EngineResult};
use crate::notify::Notifier;
use crate::transport::{
    AvailabilityProbe, EndpointClass, PatchOp, SubmitOutcome, UpstreamSubmit,
};
use medisync_pool::ConnectionPool;
use medisync_store::{now_millis, Operation, QueueEntry, QueueKind};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// How the engine reacts when the server copy diverged from the base
/// version a queued change was made against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Always resubmit with overwrite. The local change wins.
    ForceOverwrite,
    /// Resubmit with overwrite only when the local change set and the
    /// server-side divergence touch disjoint fields; otherwise the
    /// entry stays queued for manual resolution.
    SafePatchOnly,
}

impl ConflictPolicy {
    /// Whether a forced resubmit is allowed for this divergence.
    ///
    /// Only writing operations count; precondition checks on a shared
    /// field do not make a patch unsafe.
    #[must_use]
    pub fn allows_force(self, local: &[PatchOp], divergence: &[PatchOp]) -> bool {
        match self {
            Self::ForceOverwrite => true,
            Self::SafePatchOnly => !local
                .iter()
                .filter(|op| !op.test)
                .any(|l| {
                    divergence
                        .iter()
                        .filter(|op| !op.test)
                        .any(|r| paths_overlap(&l.path, &r.path))
                }),
        }
    }
}

/// Two field paths overlap when one names the other or a parent of it.
fn paths_overlap(a: &str, b: &str) -> bool {
    a == b
        || a.strip_prefix(b).is_some_and(|rest| rest.starts_with('/'))
        || b.strip_prefix(a).is_some_and(|rest| rest.starts_with('/'))
}

/// The result of one push invocation.
#[derive(Debug, Clone, Default)]
pub struct PushReport {
    /// True if the drain visited every queued entry; false when a
    /// systemic failure stopped it early or the upstream was
    /// unreachable.
    pub drained: bool,
    /// Entries confirmed by the upstream and removed from the queue.
    pub delivered: u64,
    /// Entries that stayed queued after a non-systemic failure.
    pub failed: u64,
    /// Ids of entries left queued by an unresolved conflict.
    pub conflicts: Vec<u64>,
    /// True when a transport failure stopped the drain.
    pub systemic_failure: bool,
}

impl PushReport {
    /// Drained with every entry delivered.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.drained && self.failed == 0 && !self.systemic_failure
    }
}

/// Completion handle for a push running on its own thread.
///
/// Each spawned push gets a fresh channel, so completion of one
/// invocation can never be confused with the next. The report arrives
/// whether or not the drain succeeded.
#[derive(Debug)]
pub struct PushWaiter {
    rx: mpsc::Receiver<PushReport>,
}

impl PushWaiter {
    /// Blocks until the push finishes.
    #[must_use]
    pub fn wait(self) -> PushReport {
        self.rx.recv().unwrap_or_else(|_| PushReport {
            systemic_failure: true,
            ..PushReport::default()
        })
    }

    /// Blocks up to `timeout` for the push to finish.
    #[must_use]
    pub fn wait_timeout(self, timeout: Duration) -> Option<PushReport> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Submits queued local changes upstream, in priority then FIFO order.
pub struct PushEngine {
    pool: Arc<ConnectionPool<DatastoreFactory>>,
    source: String,
    upstream: Arc<dyn UpstreamSubmit>,
    probe: Arc<dyn AvailabilityProbe>,
    policy: ConflictPolicy,
    notifier: Notifier,
}

impl PushEngine {
    /// Builds a push engine over the shared pool and collaborators.
    pub fn new(
        pool: Arc<ConnectionPool<DatastoreFactory>>,
        upstream: Arc<dyn UpstreamSubmit>,
        probe: Arc<dyn AvailabilityProbe>,
        config: &EngineConfig,
        policy: ConflictPolicy,
        notifier: Notifier,
    ) -> Self {
        Self {
            pool,
            source: config.source.clone(),
            upstream,
            probe,
            policy,
            notifier,
        }
    }

    /// Drains the outbound queue synchronously.
    ///
    /// Entries are removed only on confirmed delivery. A per-entry
    /// failure leaves that entry queued and continues; a transport
    /// failure stops the drain. Failures never propagate to the caller.
    pub fn push(&self) -> PushReport {
        match self.run() {
            Ok(report) => {
                if report.systemic_failure {
                    self.notifier.failure("push", "upstream submission failed");
                } else {
                    self.notifier.success("push");
                }
                // Unresolved conflicts need a user decision; surface
                // them as their own streak, cleared once a drain gets
                // through without one.
                if let Some(&entry_id) = report.conflicts.first() {
                    let conflict = EngineError::Conflict { entry_id };
                    self.notifier.failure("push/conflict", &conflict.to_string());
                } else if report.drained {
                    self.notifier.success("push/conflict");
                }
                report
            }
            Err(e) => {
                tracing::warn!(error = %e, "push aborted");
                self.notifier.failure("push", &e.to_string());
                PushReport {
                    systemic_failure: true,
                    ..PushReport::default()
                }
            }
        }
    }

    /// Runs the push on its own thread, returning a completion handle.
    pub fn spawn(self: &Arc<Self>) -> PushWaiter {
        let (tx, rx) = mpsc::channel();
        let engine = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("medisync-push".to_string())
            .spawn(move || {
                let _ = tx.send(engine.push());
            });
        if let Err(e) = spawned {
            // The waiter observes the dropped sender as a failed push
            tracing::warn!(error = %e, "failed to spawn push thread");
        }
        PushWaiter { rx }
    }

    fn run(&self) -> EngineResult<PushReport> {
        let mut report = PushReport::default();
        if !self.probe.is_reachable(EndpointClass::Submit) {
            tracing::debug!("upstream unreachable, skipping push");
            return Ok(report);
        }

        let entries = {
            let datastore = self.pool.read(&self.source)?;
            datastore.queue().entries_in_order(QueueKind::Outbound)
        };
        let total = entries.len();

        report.drained = true;
        for entry in entries {
            match self.upstream.submit(&entry) {
                Ok(SubmitOutcome::Accepted) => {
                    self.confirm(entry.id)?;
                    report.delivered += 1;
                }
                Ok(SubmitOutcome::Conflict(divergence)) => {
                    self.resolve_conflict(&entry, &divergence, &mut report)?;
                }
                Ok(SubmitOutcome::NotFound) => {
                    if entry.operation == Operation::Obsolete {
                        // Already gone upstream, nothing left to retire
                        tracing::debug!(entry = entry.id, "obsolete target already absent");
                        self.confirm(entry.id)?;
                        report.delivered += 1;
                    } else {
                        tracing::warn!(
                            entry = entry.id,
                            resource_type = %entry.resource_type,
                            "target record missing upstream"
                        );
                        report.failed += 1;
                    }
                }
                Ok(SubmitOutcome::Rejected(reason)) => {
                    tracing::warn!(entry = entry.id, reason = %reason, "entry rejected upstream");
                    report.failed += 1;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(entry = entry.id, error = %e, "transport down, stopping drain");
                    report.systemic_failure = true;
                    report.drained = false;
                    break;
                }
                Err(e) => {
                    tracing::warn!(entry = entry.id, error = %e, "entry submission failed");
                    report.failed += 1;
                }
            }
        }

        if report.succeeded() && total > 0 {
            let datastore = self.pool.write(&self.source)?;
            datastore.synclog().record_push_time(now_millis())?;
        }
        tracing::info!(
            delivered = report.delivered,
            failed = report.failed,
            systemic = report.systemic_failure,
            "push finished"
        );
        Ok(report)
    }

    fn confirm(&self, id: u64) -> EngineResult<()> {
        let datastore = self.pool.write(&self.source)?;
        datastore.queue().remove(id)?;
        Ok(())
    }

    fn resolve_conflict(
        &self,
        entry: &QueueEntry,
        divergence: &[PatchOp],
        report: &mut PushReport,
    ) -> EngineResult<()> {
        let force = match self.policy {
            ConflictPolicy::ForceOverwrite => true,
            ConflictPolicy::SafePatchOnly => {
                // The payload of a local change is its patch form; an
                // undecodable payload cannot be proven safe.
                ciborium::from_reader::<Vec<PatchOp>, _>(entry.payload.as_slice())
                    .map(|local| self.policy.allows_force(&local, divergence))
                    .unwrap_or(false)
            }
        };

        if force {
            match self.upstream.submit_forced(entry)? {
                SubmitOutcome::Accepted => {
                    tracing::debug!(entry = entry.id, "conflict resolved by overwrite");
                    self.confirm(entry.id)?;
                    report.delivered += 1;
                }
                outcome => {
                    tracing::warn!(entry = entry.id, ?outcome, "forced resubmit refused");
                    report.failed += 1;
                    report.conflicts.push(entry.id);
                }
            }
        } else {
            tracing::warn!(
                entry = entry.id,
                resource_type = %entry.resource_type,
                "conflict overlaps local changes, entry left queued"
            );
            report.failed += 1;
            report.conflicts.push(entry.id);
        }
        Ok(())
    }
}

impl std::fmt::Debug for PushEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushEngine")
            .field("source", &self.source)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
