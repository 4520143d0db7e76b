//! Upstream collaborator contracts and the in-memory test double.
//!
//! The engine never speaks a wire protocol itself. Queries, submissions
//! and reachability checks go through these traits; production code
//! provides implementations over whatever transport the deployment
//! uses, and tests use [`MockUpstream`].

use crate::error::{EngineError, EngineResult};
use medisync_store::QueueEntry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// One page of query results from the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPage {
    /// Serialized records, collaborator-defined encoding.
    pub items: Vec<Vec<u8>>,
    /// Total records matching the query across all pages.
    pub total_count: u64,
    /// Server version token for the result set, if the upstream
    /// provides one.
    pub etag: Option<String>,
}

/// Read access to the upstream.
pub trait UpstreamQuery: Send + Sync {
    /// Fetches one page of records.
    ///
    /// `modified_since` narrows the query to records changed after the
    /// given Unix-millisecond timestamp. An unchanged result set is an
    /// empty page, not an error.
    fn find(
        &self,
        resource_type: &str,
        filter: &str,
        offset: u64,
        count: u64,
        modified_since: Option<u64>,
    ) -> EngineResult<QueryPage>;
}

/// One operation of a change set, in patch form.
///
/// `test` operations assert a precondition and touch nothing; only
/// non-test operations write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOp {
    /// Slash-separated path of the field the operation touches.
    pub path: String,
    /// True for precondition checks, false for writes.
    pub test: bool,
}

impl PatchOp {
    /// A write operation on `path`.
    pub fn write(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            test: false,
        }
    }

    /// A precondition check on `path`.
    pub fn check(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            test: true,
        }
    }
}

/// The upstream's verdict on one submitted entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The change was applied.
    Accepted,
    /// The server copy diverged. Carries the server-side change set
    /// since the client's base version.
    Conflict(Vec<PatchOp>),
    /// The record does not exist upstream.
    NotFound,
    /// The upstream refused the entry as malformed or unauthorized.
    Rejected(String),
}

/// Write access to the upstream.
pub trait UpstreamSubmit: Send + Sync {
    /// Submits one queued change.
    fn submit(&self, entry: &QueueEntry) -> EngineResult<SubmitOutcome>;

    /// Resubmits a conflicted change, overwriting the server copy.
    fn submit_forced(&self, entry: &QueueEntry) -> EngineResult<SubmitOutcome>;
}

/// The upstream surface a reachability check targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    /// The query (read) surface.
    Query,
    /// The submission (write) surface.
    Submit,
}

/// Fast reachability probe, checked before any pass does real work.
pub trait AvailabilityProbe: Send + Sync {
    /// True if the endpoint class is currently reachable.
    fn is_reachable(&self, class: EndpointClass) -> bool;
}

/// In-memory upstream for tests: a scripted dataset, scripted submit
/// outcomes, and fault injection.
#[derive(Default)]
pub struct MockUpstream {
    datasets: Mutex<HashMap<(String, String), Vec<Vec<u8>>>>,
    etag: Mutex<Option<String>>,
    unreachable: AtomicBool,
    /// Remaining find calls before one injected network failure.
    fail_find_after: Mutex<Option<usize>>,
    /// Remaining submit calls before one injected network failure.
    fail_submit_after: Mutex<Option<usize>>,
    find_delay: Mutex<Duration>,
    find_calls: Mutex<Vec<(u64, u64)>>,
    modified_since_calls: Mutex<Vec<Option<u64>>>,
    submit_script: Mutex<VecDeque<SubmitOutcome>>,
    submitted: Mutex<Vec<u64>>,
    forced: Mutex<Vec<u64>>,
    find_count: AtomicUsize,
}

impl MockUpstream {
    /// An empty, reachable upstream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the dataset for a (resource type, filter) pair.
    pub fn set_dataset(&self, resource_type: &str, filter: &str, items: Vec<Vec<u8>>) {
        self.datasets
            .lock()
            .insert((resource_type.to_string(), filter.to_string()), items);
    }

    /// Sets the version token returned with every page.
    pub fn set_etag(&self, etag: &str) {
        *self.etag.lock() = Some(etag.to_string());
    }

    /// Marks the upstream reachable or not.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Injects one network failure after `calls` further find calls.
    pub fn fail_find_after(&self, calls: usize) {
        *self.fail_find_after.lock() = Some(calls);
    }

    /// Injects one network failure after `calls` further submit calls.
    pub fn fail_submit_after(&self, calls: usize) {
        *self.fail_submit_after.lock() = Some(calls);
    }

    /// Adds artificial latency to every find call.
    pub fn set_find_delay(&self, delay: Duration) {
        *self.find_delay.lock() = delay;
    }

    /// Pushes the outcome returned by the next unscripted submit call.
    /// Unscripted submits are `Accepted`.
    pub fn script_submit(&self, outcome: SubmitOutcome) {
        self.submit_script.lock().push_back(outcome);
    }

    /// The (offset, count) of every find call so far.
    #[must_use]
    pub fn find_calls(&self) -> Vec<(u64, u64)> {
        self.find_calls.lock().clone()
    }

    /// The `modified_since` argument of every find call so far.
    #[must_use]
    pub fn modified_since_calls(&self) -> Vec<Option<u64>> {
        self.modified_since_calls.lock().clone()
    }

    /// Ids of entries submitted (unforced) so far.
    #[must_use]
    pub fn submitted(&self) -> Vec<u64> {
        self.submitted.lock().clone()
    }

    /// Ids of entries resubmitted with overwrite so far.
    #[must_use]
    pub fn forced(&self) -> Vec<u64> {
        self.forced.lock().clone()
    }

    /// Total find calls served.
    #[must_use]
    pub fn find_count(&self) -> usize {
        self.find_count.load(Ordering::SeqCst)
    }
}

impl UpstreamQuery for MockUpstream {
    fn find(
        &self,
        resource_type: &str,
        filter: &str,
        offset: u64,
        count: u64,
        modified_since: Option<u64>,
    ) -> EngineResult<QueryPage> {
        let delay = *self.find_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.find_count.fetch_add(1, Ordering::SeqCst);
        self.find_calls.lock().push((offset, count));
        self.modified_since_calls.lock().push(modified_since);

        {
            let mut fail = self.fail_find_after.lock();
            if let Some(remaining) = fail.as_mut() {
                if *remaining == 0 {
                    *fail = None;
                    return Err(EngineError::network("injected find failure"));
                }
                *remaining -= 1;
            }
        }

        let datasets = self.datasets.lock();
        let items = datasets
            .get(&(resource_type.to_string(), filter.to_string()))
            .cloned()
            .unwrap_or_default();
        let total_count = items.len() as u64;
        let start = (offset as usize).min(items.len());
        let end = (start + count as usize).min(items.len());
        Ok(QueryPage {
            items: items[start..end].to_vec(),
            total_count,
            etag: self.etag.lock().clone(),
        })
    }
}

impl UpstreamSubmit for MockUpstream {
    fn submit(&self, entry: &QueueEntry) -> EngineResult<SubmitOutcome> {
        {
            let mut fail = self.fail_submit_after.lock();
            if let Some(remaining) = fail.as_mut() {
                if *remaining == 0 {
                    *fail = None;
                    return Err(EngineError::network("injected submit failure"));
                }
                *remaining -= 1;
            }
        }
        self.submitted.lock().push(entry.id);
        Ok(self
            .submit_script
            .lock()
            .pop_front()
            .unwrap_or(SubmitOutcome::Accepted))
    }

    fn submit_forced(&self, entry: &QueueEntry) -> EngineResult<SubmitOutcome> {
        self.forced.lock().push(entry.id);
        Ok(SubmitOutcome::Accepted)
    }
}

impl AvailabilityProbe for MockUpstream {
    fn is_reachable(&self, _class: EndpointClass) -> bool {
        !self.unreachable.load(Ordering::SeqCst)
    }
}
