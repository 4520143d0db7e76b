//! Adaptive page sizing over the configured ladder.

use crate::config::PageLadder;
use std::time::Duration;

/// Walks the page ladder one rung at a time based on observed latency
/// and the remaining result set.
///
/// A page answered within its rung's latency threshold escalates when
/// the remaining records justify a larger page; a slow page
/// de-escalates; a small remainder collapses straight to the base rung
/// so the tail is not over-fetched.
#[derive(Debug)]
pub struct PageSizer {
    ladder: PageLadder,
    rung: usize,
}

impl PageSizer {
    /// A sizer starting at the base rung of the ladder.
    #[must_use]
    pub fn new(ladder: PageLadder) -> Self {
        Self { ladder, rung: 0 }
    }

    /// The page size to request next.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.ladder.rung(self.rung).size
    }

    /// Feeds back one completed page: its observed latency and the
    /// records still unfetched after it.
    pub fn observe(&mut self, latency: Duration, remaining: u64) {
        if remaining <= self.ladder.base().size {
            self.rung = 0;
            return;
        }
        if latency > self.ladder.rung(self.rung).max_latency {
            self.rung = self.rung.saturating_sub(1);
            tracing::debug!(
                latency_ms = latency.as_millis() as u64,
                size = self.current(),
                "slow page, de-escalating"
            );
        } else if self.rung + 1 < self.ladder.len() && remaining > self.current() {
            self.rung += 1;
        }
    }
}
