//! Engine configuration: triggers, subscriptions, and the page ladder.

use medisync_store::Priority;
use std::time::Duration;

/// The event that started a synchronization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// Application startup.
    OnStart,
    /// Connectivity returned.
    OnNetworkChange,
    /// The periodic poll timer.
    Periodic,
    /// Explicit user request.
    Manual,
}

impl TriggerKind {
    fn bit(self) -> u8 {
        match self {
            Self::OnStart => 0b0001,
            Self::OnNetworkChange => 0b0010,
            Self::Periodic => 0b0100,
            Self::Manual => 0b1000,
        }
    }

    /// Short label used in log fields.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::OnStart => "on_start",
            Self::OnNetworkChange => "on_network_change",
            Self::Periodic => "periodic",
            Self::Manual => "manual",
        }
    }
}

/// The set of triggers a subscription responds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerMask(u8);

impl TriggerMask {
    /// Responds to no trigger.
    pub const NONE: TriggerMask = TriggerMask(0);
    /// Responds to every trigger.
    pub const ALL: TriggerMask = TriggerMask(0b1111);

    /// Adds a trigger to the mask.
    #[must_use]
    pub fn with(self, kind: TriggerKind) -> Self {
        Self(self.0 | kind.bit())
    }

    /// True if the mask contains the trigger.
    #[must_use]
    pub fn contains(self, kind: TriggerKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

impl Default for TriggerMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// One rung of the adaptive page ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRung {
    /// Page size requested at this rung.
    pub size: u64,
    /// Latency above which a page at this rung counts as slow.
    pub max_latency: Duration,
}

/// The ordered page sizes the puller walks, with per-rung latency
/// thresholds. Escalation moves one rung at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLadder {
    rungs: Vec<PageRung>,
}

impl PageLadder {
    /// Builds a ladder from explicit rungs. Falls back to the default
    /// ladder if `rungs` is empty.
    #[must_use]
    pub fn new(rungs: Vec<PageRung>) -> Self {
        if rungs.is_empty() {
            Self::default()
        } else {
            Self { rungs }
        }
    }

    /// A single-rung ladder with a fixed page size.
    #[must_use]
    pub fn fixed(size: u64) -> Self {
        Self {
            rungs: vec![PageRung {
                size,
                max_latency: Duration::from_secs(30),
            }],
        }
    }

    /// The rung at `index`, clamped to the top of the ladder.
    #[must_use]
    pub fn rung(&self, index: usize) -> PageRung {
        self.rungs[index.min(self.rungs.len() - 1)]
    }

    /// The bottom (smallest) rung.
    #[must_use]
    pub fn base(&self) -> PageRung {
        self.rungs[0]
    }

    /// Number of rungs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rungs.len()
    }

    /// True if the ladder has no rungs. Never true for ladders built
    /// through this type's constructors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rungs.is_empty()
    }
}

impl Default for PageLadder {
    fn default() -> Self {
        let thresholds = [500, 1000, 2000, 4000, 8000];
        Self {
            rungs: [100u64, 500, 1000, 2500, 5000]
                .into_iter()
                .zip(thresholds)
                .map(|(size, ms)| PageRung {
                    size,
                    max_latency: Duration::from_millis(ms),
                })
                .collect(),
        }
    }
}

/// One resource the engine keeps replicated.
#[derive(Debug, Clone)]
pub struct ResourceSubscription {
    /// The upstream resource type.
    pub resource_type: String,
    /// Server-side filter expression, empty for unfiltered.
    pub filter: String,
    /// Which triggers pull this resource.
    pub triggers: TriggerMask,
    /// Priority of the inbound batches this resource produces.
    pub priority: Priority,
}

impl ResourceSubscription {
    /// Creates a subscription responding to all triggers at normal
    /// priority.
    pub fn new(resource_type: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            filter: filter.into(),
            triggers: TriggerMask::ALL,
            priority: Priority::Normal,
        }
    }

    /// Restricts the subscription to the given triggers.
    #[must_use]
    pub fn with_triggers(mut self, triggers: TriggerMask) -> Self {
        self.triggers = triggers;
        self
    }

    /// Sets the inbound priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Tunables for the replication engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Data-source name all engine storage goes through.
    pub source: String,
    /// Interval between periodic passes, measured from the end of the
    /// previous attempt.
    pub poll_interval: Duration,
    /// Backoff between startup reachability probes.
    pub start_backoff: Duration,
    /// A persisted cursor older than this is discarded, not resumed.
    pub cursor_staleness: Duration,
    /// The adaptive page ladder.
    pub ladder: PageLadder,
    /// Resources to keep replicated, pulled in this order.
    pub subscriptions: Vec<ResourceSubscription>,
}

impl EngineConfig {
    /// Configuration over the named data source.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    /// Sets the periodic poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the startup reachability backoff.
    #[must_use]
    pub fn with_start_backoff(mut self, backoff: Duration) -> Self {
        self.start_backoff = backoff;
        self
    }

    /// Sets the cursor staleness window.
    #[must_use]
    pub fn with_cursor_staleness(mut self, staleness: Duration) -> Self {
        self.cursor_staleness = staleness;
        self
    }

    /// Sets the page ladder.
    #[must_use]
    pub fn with_ladder(mut self, ladder: PageLadder) -> Self {
        self.ladder = ladder;
        self
    }

    /// Appends a subscription. Pass order follows insertion order.
    #[must_use]
    pub fn with_subscription(mut self, subscription: ResourceSubscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source: "main".to_string(),
            poll_interval: Duration::from_secs(300),
            start_backoff: Duration::from_secs(10),
            cursor_staleness: Duration::from_secs(3600),
            ladder: PageLadder::default(),
            subscriptions: Vec::new(),
        }
    }
}
