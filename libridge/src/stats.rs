use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the session counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub lines_received: u64,
    pub records_published: u64,
    pub json_records_published: u64,
    pub messages_forwarded: u64,
    pub messages_dropped: u64,
    pub publish_failures: u64,
    pub connects: u64,
}

/// Counters updated by the dispatch loop, readable from anywhere
#[derive(Debug, Default)]
pub struct SessionStats {
    lines_received: AtomicU64,
    records_published: AtomicU64,
    json_records_published: AtomicU64,
    messages_forwarded: AtomicU64,
    messages_dropped: AtomicU64,
    publish_failures: AtomicU64,
    connects: AtomicU64,
}

impl SessionStats {
    pub(crate) fn line_received(&self) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_published(&self, json: bool) {
        let counter = if json {
            &self.json_records_published
        } else {
            &self.records_published
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn message_forwarded(&self) {
        self.messages_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connected(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            lines_received: self.lines_received.load(Ordering::Relaxed),
            records_published: self.records_published.load(Ordering::Relaxed),
            json_records_published: self.json_records_published.load(Ordering::Relaxed),
            messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
        }
    }
}
