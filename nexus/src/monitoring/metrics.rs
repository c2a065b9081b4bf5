//! Metrics collection for the message bus

use super::*;

/// Counters maintained by the bus. `delivered` counts mailbox copies, so a
/// fan-out message adds one per recipient.
#[derive(Debug, Default)]
pub struct BusMetrics {
    published: AtomicU64,
    dispatched: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    expired: AtomicU64,
    unroutable: AtomicU64,
    resolved: AtomicU64,
    late_responses: AtomicU64,
    correlation_timeouts: AtomicU64,
    dropped: AtomicU64,
    discarded: AtomicU64,
    log_write_failures: AtomicU64,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unroutable(&self) {
        self.unroutable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_response(&self) {
        self.late_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_correlation_timeout(&self) {
        self.correlation_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self, count: u64) {
        self.discarded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_log_write_failure(&self) {
        self.log_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BusMetricsSnapshot {
        BusMetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            late_responses: self.late_responses.load(Ordering::Relaxed),
            correlation_timeouts: self.correlation_timeouts.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            log_write_failures: self.log_write_failures.load(Ordering::Relaxed),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMetricsSnapshot {
    pub published: u64,
    pub dispatched: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub expired: u64,
    pub unroutable: u64,
    pub resolved: u64,
    pub late_responses: u64,
    pub correlation_timeouts: u64,
    pub dropped: u64,
    pub discarded: u64,
    pub log_write_failures: u64,
    pub timestamp: DateTime<Utc>,
}
