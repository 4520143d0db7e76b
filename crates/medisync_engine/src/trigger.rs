//! The trigger coordinator: turns external events into synchronization
//! passes, one pass at a time.

use crate::config::{EngineConfig, TriggerKind};
use crate::pull::PullEngine;
use crate::push::{PushEngine, PushReport};
use crate::transport::{AvailabilityProbe, EndpointClass};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What one triggered pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSummary {
    /// The trigger that requested the pass.
    pub trigger: TriggerKind,
    /// False when the request was dropped because a pass was already
    /// running or shutdown was in progress.
    pub ran: bool,
    /// Subscriptions pulled.
    pub resources: u64,
    /// Records fetched across all subscriptions.
    pub fetched: u64,
}

impl PassSummary {
    fn dropped(trigger: TriggerKind) -> Self {
        Self {
            trigger,
            ran: false,
            resources: 0,
            fetched: 0,
        }
    }
}

/// Serializes synchronization passes over the configured subscriptions.
///
/// At most one pass runs at a time; a trigger arriving while a pass is
/// in flight is dropped, not queued, since the running pass already
/// observes the freshest upstream state. Subscriptions run sequentially
/// in configuration order, and the shutdown flag is checked between
/// resources as the only cancellation point.
pub struct TriggerCoordinator {
    config: EngineConfig,
    puller: Arc<PullEngine>,
    pusher: Arc<PushEngine>,
    probe: Arc<dyn AvailabilityProbe>,
    pass_guard: Mutex<()>,
    running: AtomicBool,
    sleep_lock: Mutex<()>,
    wake: Condvar,
}

impl TriggerCoordinator {
    /// Builds a coordinator over the two engines.
    pub fn new(
        config: EngineConfig,
        puller: Arc<PullEngine>,
        pusher: Arc<PushEngine>,
        probe: Arc<dyn AvailabilityProbe>,
    ) -> Self {
        Self {
            config,
            puller,
            pusher,
            probe,
            pass_guard: Mutex::new(()),
            running: AtomicBool::new(true),
            sleep_lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    /// Runs one pull pass for every subscription matching the trigger.
    ///
    /// Returns immediately with `ran == false` if a pass is already in
    /// flight.
    pub fn pull(&self, trigger: TriggerKind) -> PassSummary {
        let Some(_pass) = self.pass_guard.try_lock() else {
            tracing::warn!(trigger = trigger.label(), "pass in flight, dropping trigger");
            return PassSummary::dropped(trigger);
        };

        let mut summary = PassSummary {
            trigger,
            ran: true,
            resources: 0,
            fetched: 0,
        };
        for subscription in &self.config.subscriptions {
            if !self.running.load(Ordering::SeqCst) {
                tracing::debug!("shutdown requested, ending pass early");
                break;
            }
            if !subscription.triggers.contains(trigger) {
                continue;
            }
            summary.fetched += self.puller.pull_prioritized(
                &subscription.resource_type,
                &subscription.filter,
                false,
                trigger.label(),
                subscription.priority,
            );
            summary.resources += 1;
        }
        tracing::info!(
            trigger = trigger.label(),
            resources = summary.resources,
            fetched = summary.fetched,
            "pass finished"
        );
        summary
    }

    /// Drains the outbound queue synchronously.
    pub fn push(&self) -> PushReport {
        self.pusher.push()
    }

    /// Pushes local changes, waits for the drain to finish, then runs a
    /// pull pass. The pull runs regardless of the push outcome.
    pub fn push_then_pull(&self, trigger: TriggerKind) -> (PushReport, PassSummary) {
        let waiter = self.pusher.spawn();
        let report = waiter.wait();
        let summary = self.pull(trigger);
        (report, summary)
    }

    /// Startup pass: retries with a fixed backoff until the upstream is
    /// reachable or shutdown is requested.
    pub fn run_start(&self) -> PassSummary {
        while self.running.load(Ordering::SeqCst) {
            if self.probe.is_reachable(EndpointClass::Query) {
                return self.pull(TriggerKind::OnStart);
            }
            tracing::debug!(
                backoff_ms = self.config.start_backoff.as_millis() as u64,
                "upstream unreachable at startup, backing off"
            );
            self.sleep(self.config.start_backoff);
        }
        PassSummary::dropped(TriggerKind::OnStart)
    }

    /// Reacts to a connectivity change. Returns the pass summary when
    /// connectivity came back.
    pub fn on_network_change(&self, up: bool) -> Option<PassSummary> {
        if !up || !self.running.load(Ordering::SeqCst) {
            tracing::debug!(up, "connectivity change, no pass");
            return None;
        }
        Some(self.pull(TriggerKind::OnNetworkChange))
    }

    /// Periodic loop: sleeps the poll interval, then runs a pass, until
    /// shutdown. The interval is measured from the end of each attempt,
    /// so a long pass never stacks the next one behind it.
    pub fn run_periodic(&self) {
        loop {
            self.sleep(self.config.poll_interval);
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.pull(TriggerKind::Periodic);
        }
        tracing::debug!("periodic loop stopped");
    }

    /// Requests shutdown: wakes sleeping loops and makes the next
    /// cancellation point end the running pass.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _lock = self.sleep_lock.lock();
        self.wake.notify_all();
    }

    /// True until [`TriggerCoordinator::shutdown`] is called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        let mut lock = self.sleep_lock.lock();
        if self.running.load(Ordering::SeqCst) {
            let _ = self.wake.wait_for(&mut lock, duration);
        }
    }
}

impl std::fmt::Debug for TriggerCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerCoordinator")
            .field("subscriptions", &self.config.subscriptions.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
