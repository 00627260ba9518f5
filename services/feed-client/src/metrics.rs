//! Counters for the feed client
//!
//! Lock-free counters updated from the router, sender and connection tasks,
//! exported as a flat map for logging or scraping.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Core counters for one client instance.
#[derive(Debug, Default)]
pub struct FeedMetrics {
    pub messages_received: AtomicU64,
    pub messages_malformed: AtomicU64,
    pub ticks_applied: AtomicU64,
    pub proposals_applied: AtomicU64,
    pub retries_enqueued: AtomicU64,
    pub rate_limit_backoffs: AtomicU64,
    pub frames_sent: AtomicU64,
    pub keepalives_sent: AtomicU64,
    pub reconnects: AtomicU64,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.messages_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tick(&self) {
        self.ticks_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_proposal(&self) {
        self.proposals_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backoff(&self) {
        self.rate_limit_backoffs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_keepalive(&self) {
        self.keepalives_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Export as a BTreeMap for stable ordering in log lines.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        let counters: [(&str, &AtomicU64); 9] = [
            ("messages_received", &self.messages_received),
            ("messages_malformed", &self.messages_malformed),
            ("ticks_applied", &self.ticks_applied),
            ("proposals_applied", &self.proposals_applied),
            ("retries_enqueued", &self.retries_enqueued),
            ("rate_limit_backoffs", &self.rate_limit_backoffs),
            ("frames_sent", &self.frames_sent),
            ("keepalives_sent", &self.keepalives_sent),
            ("reconnects", &self.reconnects),
        ];
        for (name, counter) in counters {
            m.insert(name.to_string(), counter.load(Ordering::Relaxed));
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_export() {
        let metrics = FeedMetrics::new();
        metrics.record_message();
        metrics.record_message();
        metrics.record_retry();

        let exported = metrics.export();
        assert_eq!(exported["messages_received"], 2);
        assert_eq!(exported["retries_enqueued"], 1);
        assert_eq!(exported["reconnects"], 0);
        assert_eq!(exported.len(), 9);
    }
}
