//! End-to-end replication scenarios over the public API.

use medisync_engine::{
    AvailabilityProbe, ConflictPolicy, DatastoreFactory, EngineConfig, MockUpstream, Notifier,
    PageLadder, PatchOp, PullEngine, PushEngine, ResourceSubscription, SinkRegistry,
    SubmitOutcome, TriggerCoordinator, TriggerKind, UpstreamQuery, UpstreamSubmit,
};
use medisync_pool::ConnectionPool;
use medisync_store::{Operation, Priority, QueueKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Patient {
    id: u32,
    name: String,
}

fn patient_record(id: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    ciborium::into_writer(
        &Patient {
            id,
            name: format!("patient-{id}"),
        },
        &mut buf,
    )
    .unwrap();
    buf
}

struct Harness {
    pool: Arc<ConnectionPool<DatastoreFactory>>,
    upstream: Arc<MockUpstream>,
    registry: Arc<SinkRegistry>,
    puller: Arc<PullEngine>,
    pusher: Arc<PushEngine>,
}

fn harness(registry: SinkRegistry) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let pool = Arc::new(ConnectionPool::new(DatastoreFactory::in_memory()));
    let upstream = Arc::new(MockUpstream::new());
    let registry = Arc::new(registry);
    let config = EngineConfig::new("main").with_ladder(PageLadder::fixed(100));

    let puller = Arc::new(PullEngine::new(
        Arc::clone(&pool),
        Arc::clone(&upstream) as Arc<dyn UpstreamQuery>,
        Arc::clone(&upstream) as Arc<dyn AvailabilityProbe>,
        Arc::clone(&registry),
        &config,
        Notifier::disabled(),
    ));
    let pusher = Arc::new(PushEngine::new(
        Arc::clone(&pool),
        Arc::clone(&upstream) as Arc<dyn UpstreamSubmit>,
        Arc::clone(&upstream) as Arc<dyn AvailabilityProbe>,
        &config,
        ConflictPolicy::SafePatchOnly,
        Notifier::disabled(),
    ));
    Harness {
        pool,
        upstream,
        registry,
        puller,
        pusher,
    }
}

/// A 250-record result set over a 100-record page size: three pages,
/// three durable batches, one checkpoint carrying the first page's ETag.
#[test]
fn full_pull_of_250_records_in_three_pages() {
    let hx = harness(SinkRegistry::new());
    hx.upstream.set_dataset(
        "Patient",
        "status=active",
        (0..250).map(patient_record).collect(),
    );
    hx.upstream.set_etag("E1");

    let fetched = hx.puller.pull("Patient", "status=active", false, "manual");
    assert_eq!(fetched, 250);
    assert_eq!(
        hx.upstream.find_calls(),
        vec![(0, 100), (100, 100), (200, 100)]
    );

    let datastore = hx.pool.read("main").unwrap();
    let batches = datastore.queue().entries_in_order(QueueKind::Inbound);
    assert_eq!(batches.len(), 3);
    assert!(batches
        .iter()
        .all(|e| e.operation == Operation::Sync && e.resource_type == "Patient"));

    let cp = datastore
        .synclog()
        .checkpoint("Patient", "status=active")
        .unwrap();
    assert_eq!(cp.last_etag.as_deref(), Some("E1"));
    assert!(datastore
        .synclog()
        .active_cursor("Patient", "status=active")
        .is_none());
}

/// A pull that dies mid-way leaves its cursor at the last durable page
/// boundary; after a restart the next pull resumes there, so every
/// record is enqueued at least once and the checkpoint advances only at
/// the true end.
#[test]
fn interrupted_pull_survives_restart_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let dataset: Vec<Vec<u8>> = (0..250).map(patient_record).collect();

    let upstream = Arc::new(MockUpstream::new());
    upstream.set_dataset("Patient", "", dataset.clone());
    upstream.set_etag("E1");
    upstream.fail_find_after(2);

    let config = EngineConfig::new("clinic").with_ladder(PageLadder::fixed(100));

    {
        let pool = Arc::new(ConnectionPool::new(DatastoreFactory::file(dir.path())));
        let puller = PullEngine::new(
            Arc::clone(&pool),
            Arc::clone(&upstream) as Arc<dyn UpstreamQuery>,
            Arc::clone(&upstream) as Arc<dyn AvailabilityProbe>,
            Arc::new(SinkRegistry::new()),
            &config,
            Notifier::disabled(),
        );
        assert_eq!(puller.pull("Patient", "", false, "on_start"), 200);

        let datastore = pool.read("clinic").unwrap();
        assert_eq!(datastore.synclog().active_cursor("Patient", "").unwrap().offset, 200);
        assert!(datastore.synclog().checkpoint("Patient", "").is_none());
    }

    // New pool over the same directory: the process restarted
    let pool = Arc::new(ConnectionPool::new(DatastoreFactory::file(dir.path())));
    let puller = PullEngine::new(
        Arc::clone(&pool),
        Arc::clone(&upstream) as Arc<dyn UpstreamQuery>,
        Arc::clone(&upstream) as Arc<dyn AvailabilityProbe>,
        Arc::new(SinkRegistry::new()),
        &config,
        Notifier::disabled(),
    );
    assert_eq!(puller.pull("Patient", "", false, "on_start"), 50);

    let offsets: Vec<u64> = upstream.find_calls().iter().map(|c| c.0).collect();
    assert_eq!(offsets, vec![0, 100, 200, 200]);

    let datastore = pool.read("clinic").unwrap();
    assert_eq!(datastore.queue().count(QueueKind::Inbound), 3);
    assert!(datastore.synclog().checkpoint("Patient", "").is_some());
    assert!(datastore.synclog().active_cursor("Patient", "").is_none());
}

/// Pulled batches flow through the registry into the typed handler, and
/// applied entries leave the inbound queue.
#[test]
fn inbound_batches_drain_through_typed_sinks() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = SinkRegistry::new();
    {
        let seen = Arc::clone(&seen);
        registry.register("Patient", move |records: Vec<Patient>| {
            seen.lock().extend(records.into_iter().map(|p| p.id));
            Ok(())
        });
    }

    let hx = harness(registry);
    hx.upstream
        .set_dataset("Patient", "", (0..250).map(patient_record).collect());

    assert_eq!(hx.puller.pull("Patient", "", false, "manual"), 250);
    let applied = hx.registry.drain_inbound(&hx.pool, "main").unwrap();
    assert_eq!(applied, 3);

    let ids = seen.lock();
    assert_eq!(ids.len(), 250);
    assert_eq!(ids[0], 0);
    assert_eq!(ids[249], 249);

    let datastore = hx.pool.read("main").unwrap();
    assert!(datastore.queue().is_empty(QueueKind::Inbound));
}

/// Three queued changes where the second hits an unsafe conflict: the
/// neighbours deliver, the conflicted entry stays queued and is named
/// in the report.
#[test]
fn push_with_conflicting_middle_entry() {
    let hx = harness(SinkRegistry::new());

    let patch = |ops: &[PatchOp]| {
        let mut buf = Vec::new();
        ciborium::into_writer(&ops, &mut buf).unwrap();
        buf
    };
    let ids: Vec<u64> = {
        let datastore = hx.pool.write("main").unwrap();
        (0..3)
            .map(|i| {
                datastore
                    .queue()
                    .enqueue(
                        QueueKind::Outbound,
                        Priority::Normal,
                        "Patient",
                        Operation::Update,
                        patch(&[PatchOp::write("address/city")]),
                    )
                    .unwrap_or_else(|_| panic!("enqueue {i}"))
            })
            .collect()
    };

    hx.upstream.script_submit(SubmitOutcome::Accepted);
    hx.upstream
        .script_submit(SubmitOutcome::Conflict(vec![PatchOp::write("address")]));
    hx.upstream.script_submit(SubmitOutcome::Accepted);

    let report = hx.pusher.push();
    assert!(report.drained);
    assert!(!report.succeeded());
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.conflicts, vec![ids[1]]);

    let datastore = hx.pool.read("main").unwrap();
    let remaining = datastore.queue().entries_in_order(QueueKind::Outbound);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, ids[1]);
    // A partial drain never counts as a completed push
    assert!(datastore.synclog().last_push_time().is_none());
}

/// The coordinator serializes passes: a trigger firing mid-pass is
/// dropped with zero upstream traffic of its own.
#[test]
fn coordinator_single_pass_guard() {
    let hx = harness(SinkRegistry::new());
    hx.upstream
        .set_dataset("Patient", "", (0..10).map(patient_record).collect());
    hx.upstream
        .set_find_delay(std::time::Duration::from_millis(150));

    let config = EngineConfig::new("main")
        .with_ladder(PageLadder::fixed(100))
        .with_subscription(ResourceSubscription::new("Patient", ""));
    let coordinator = Arc::new(TriggerCoordinator::new(
        config,
        Arc::clone(&hx.puller),
        Arc::clone(&hx.pusher),
        Arc::clone(&hx.upstream) as Arc<dyn AvailabilityProbe>,
    ));

    let first = {
        let coordinator = Arc::clone(&coordinator);
        std::thread::spawn(move || coordinator.pull(TriggerKind::Periodic))
    };
    std::thread::sleep(std::time::Duration::from_millis(40));
    let second = coordinator.pull(TriggerKind::Manual);
    let first = first.join().unwrap();

    assert!(first.ran);
    assert_eq!(first.fetched, 10);
    assert!(!second.ran);
    assert_eq!(second.fetched, 0);
    assert_eq!(hx.upstream.find_count(), 1);

    let datastore = hx.pool.read("main").unwrap();
    assert_eq!(datastore.queue().count(QueueKind::Inbound), 1);
}
