//! Failure notifications, de-duplicated per failure streak.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Receives user-facing failure notifications from the engines.
pub trait NotificationSink: Send + Sync {
    /// A failure streak started for `key`.
    fn alert(&self, key: &str, message: &str);

    /// The streak for `key` ended with a success.
    fn clear(&self, key: &str);
}

/// A sink that discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn alert(&self, _key: &str, _message: &str) {}
    fn clear(&self, _key: &str) {}
}

/// De-duplicating front for a [`NotificationSink`].
///
/// A repeating failure raises exactly one alert for its key until a
/// success clears the streak; the next failure after that alerts again.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    streaks: Arc<Mutex<HashSet<String>>>,
}

impl Notifier {
    /// Wraps a sink.
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            streaks: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// A notifier that alerts nowhere.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Arc::new(NullSink))
    }

    /// Records a failure for `key`, alerting only if no streak is open.
    pub fn failure(&self, key: &str, message: &str) {
        if self.streaks.lock().insert(key.to_string()) {
            tracing::warn!(key, message, "replication failure");
            self.sink.alert(key, message);
        } else {
            tracing::debug!(key, "repeat failure suppressed");
        }
    }

    /// Records a success for `key`, clearing any open streak.
    pub fn success(&self, key: &str) {
        if self.streaks.lock().remove(key) {
            self.sink.clear(key);
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("open_streaks", &self.streaks.lock().len())
            .finish_non_exhaustive()
    }
}
