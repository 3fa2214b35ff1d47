use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
fn metric_inc_endpoint(name: &'static str, endpoint: &str) {
    metrics::increment_counter!(name, "endpoint" => endpoint.to_string());
}

#[cfg(not(feature = "metrics"))]
fn metric_inc_endpoint(_name: &'static str, _endpoint: &str) {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Counter {
    Enqueued,
    NoSubscription,
    Filtered,
    QueueFull,
    NotRunning,
    Attempted,
    Delivered,
    AttemptFailed,
    RetryScheduled,
    Deferred,
    CircuitOpenDropped,
    RateLimited,
    RetriesExhausted,
    RetryQueueFull,
    Abandoned,
}

const COUNTERS: usize = 15;

impl Counter {
    fn metric_name(self) -> &'static str {
        match self {
            Counter::Enqueued => "webhook.dispatch.enqueued",
            Counter::NoSubscription => "webhook.dispatch.no_subscription",
            Counter::Filtered => "webhook.dispatch.filtered",
            Counter::QueueFull => "webhook.dispatch.queue_full",
            Counter::NotRunning => "webhook.dispatch.not_running",
            Counter::Attempted => "webhook.delivery.attempted",
            Counter::Delivered => "webhook.delivery.success",
            Counter::AttemptFailed => "webhook.delivery.failure",
            Counter::RetryScheduled => "webhook.delivery.retry_scheduled",
            Counter::Deferred => "webhook.delivery.circuit_deferred",
            Counter::CircuitOpenDropped => "webhook.delivery.circuit_dropped",
            Counter::RateLimited => "webhook.rate_limited.total",
            Counter::RetriesExhausted => "webhook.delivery.exhausted",
            Counter::RetryQueueFull => "webhook.delivery.retry_queue_full",
            Counter::Abandoned => "webhook.delivery.abandoned",
        }
    }
}

/// Always-on outcome counters. Mirrored to `metrics` when that feature is on.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    counters: [AtomicU64; COUNTERS],
}

impl DispatcherStats {
    pub(crate) fn incr(&self, counter: Counter) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
        metric_inc(counter.metric_name());
    }

    pub(crate) fn incr_endpoint(&self, counter: Counter, endpoint: &str) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
        metric_inc_endpoint(counter.metric_name(), endpoint);
    }

    fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.get(Counter::Enqueued),
            skipped_no_subscription: self.get(Counter::NoSubscription),
            skipped_filtered: self.get(Counter::Filtered),
            dropped_queue_full: self.get(Counter::QueueFull),
            rejected_not_running: self.get(Counter::NotRunning),
            attempts: self.get(Counter::Attempted),
            delivered: self.get(Counter::Delivered),
            failed_attempts: self.get(Counter::AttemptFailed),
            retries_scheduled: self.get(Counter::RetryScheduled),
            circuit_deferred: self.get(Counter::Deferred),
            circuit_dropped: self.get(Counter::CircuitOpenDropped),
            rate_limited: self.get(Counter::RateLimited),
            retries_exhausted: self.get(Counter::RetriesExhausted),
            dropped_retry_queue_full: self.get(Counter::RetryQueueFull),
            abandoned: self.get(Counter::Abandoned),
        }
    }
}

/// Copy of every counter at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub skipped_no_subscription: u64,
    pub skipped_filtered: u64,
    pub dropped_queue_full: u64,
    pub rejected_not_running: u64,
    /// HTTP requests actually sent.
    pub attempts: u64,
    pub delivered: u64,
    pub failed_attempts: u64,
    pub retries_scheduled: u64,
    pub circuit_deferred: u64,
    pub circuit_dropped: u64,
    pub rate_limited: u64,
    pub retries_exhausted: u64,
    pub dropped_retry_queue_full: u64,
    pub abandoned: u64,
}

impl StatsSnapshot {
    /// Jobs that reached a terminal state (delivered or dropped).
    pub fn finished(&self) -> u64 {
        self.delivered
            + self.circuit_dropped
            + self.retries_exhausted
            + self.dropped_retry_queue_full
            + self.abandoned
    }
}
