use thiserror::Error;

/// Rejected subscription expression. Only surfaced at configuration time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("invalid event pattern: {token:?}")]
    InvalidEventPattern { token: String },
}

/// Errors returned when dispatching work fails *before* delivery begins.
///
/// These are plain values; the producer is free to ignore them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Delivery queue is full; the event was dropped.
    #[error("delivery queue is full")]
    QueueFull,

    /// Dispatcher is not started or has been stopped.
    #[error("dispatcher is not running")]
    NotRunning,
}

/// Unrecognised `WEBHOOK_OPEN_CIRCUIT_POLICY` value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown open circuit policy {0:?}, expected \"drop\" or \"reschedule\"")]
pub struct InvalidOpenCircuitPolicy(pub String);

/// Errors returned by [`Dispatcher::start`](crate::Dispatcher::start).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StartError {
    #[error("no tokio runtime available to spawn delivery workers")]
    NoRuntime,

    #[error("dispatcher already started")]
    AlreadyStarted,

    #[error("dispatcher was stopped and cannot be restarted")]
    Stopped,
}

/// Why a dispatched event did not produce a delivery job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Session has no enabled webhook with a URL.
    NoSubscription,

    /// Subscription does not select this event type.
    Filtered,
}

/// Result of a successful call to [`Dispatcher::dispatch`](crate::Dispatcher::dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Enqueued,
    Skipped(SkipReason),
}

/// Outcome of one pass of a job through a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Job was handed back for another attempt.
    Retrying(FailureReason),
    /// Rescheduled without an attempt because the circuit is open.
    Deferred,
    Dropped(DropReason),
}

/// Reasons a job left the system without being delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Circuit open and no retry budget left to wait it out.
    CircuitOpen,

    /// Retry budget used up; carries the last failure.
    RetriesExhausted(FailureReason),

    /// Retry scheduler had no room for the job.
    RetryQueueFull,

    /// Request body could not be built.
    Unserializable,

    /// Dispatcher stopped before the job could be parked for retry.
    Shutdown,
}

/// Reasons a single delivery attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("request timed out")]
    Timeout,

    #[error("network error")]
    Network,

    #[error("endpoint responded with HTTP {0}")]
    Status(u16),

    /// No token was available; no request was made.
    #[error("endpoint rate limit reached")]
    RateLimited,
}

impl FailureReason {
    /// Whether the endpoint was actually contacted.
    pub fn reached_network(&self) -> bool {
        !matches!(self, FailureReason::RateLimited)
    }
}
