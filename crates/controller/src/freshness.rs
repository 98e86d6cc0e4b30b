//! Tracks the last fresh signal (moisture reading or heartbeat) for a plant.

use time::{Duration, OffsetDateTime};

#[derive(Debug, Clone, Default)]
pub struct FreshnessTracker {
    last_seen: Option<OffsetDateTime>,
}

impl FreshnessTracker {
    pub fn new(last_seen: Option<OffsetDateTime>) -> Self {
        Self { last_seen }
    }

    pub fn last_seen(&self) -> Option<OffsetDateTime> {
        self.last_seen
    }

    /// Record a signal. Signals older than the current last-seen are
    /// dropped; returns whether `at` was taken.
    pub fn record_signal(&mut self, at: OffsetDateTime) -> bool {
        match self.last_seen {
            Some(seen) if at < seen => false,
            _ => {
                self.last_seen = Some(at);
                true
            }
        }
    }

    /// Never having seen a signal counts as stale.
    pub fn is_fresh(&self, now: OffsetDateTime, stale_after: Duration) -> bool {
        match self.last_seen {
            Some(seen) => now - seen <= stale_after,
            None => false,
        }
    }

    pub fn age(&self, now: OffsetDateTime) -> Option<Duration> {
        self.last_seen.map(|seen| now - seen)
    }
}
