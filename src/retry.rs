//! Linear retry backoff and the delay heap that feeds retries back in.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::stats::{Counter, DispatcherStats};
use crate::types::DeliveryJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed per job, counting the first one.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    /// Wait before the attempt following failure number `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(attempt.max(1))
    }

    pub fn has_budget(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

#[derive(Debug)]
pub(crate) struct TimedJob {
    pub(crate) ready_at: Instant,
    pub(crate) job: DeliveryJob,
}

impl Eq for TimedJob {}

impl PartialEq for TimedJob {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at.eq(&other.ready_at)
    }
}

impl Ord for TimedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.ready_at.cmp(&self.ready_at)
    }
}

impl PartialOrd for TimedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Upper bound on how far ahead a deadline is placed.
pub(crate) const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + delay`, capped instead of overflowing.
pub(crate) fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Why a job could not be parked. The job is handed back.
#[derive(Debug)]
pub enum ScheduleError {
    /// Scheduler inbox is full.
    Full(DeliveryJob),
    /// Scheduler has exited; the dispatcher is stopping.
    Closed(DeliveryJob),
}

/// Cloneable handle workers use to park a job for later.
#[derive(Debug, Clone)]
pub struct RetryHandle {
    tx: mpsc::Sender<TimedJob>,
}

impl RetryHandle {
    /// Hand `job` to the scheduler without waiting.
    pub fn schedule(&self, job: DeliveryJob, delay: Duration) -> Result<(), ScheduleError> {
        let timed = TimedJob {
            ready_at: deadline_after(delay),
            job,
        };
        self.tx.try_send(timed).map_err(|err| match err {
            mpsc::error::TrySendError::Full(t) => ScheduleError::Full(t.job),
            mpsc::error::TrySendError::Closed(t) => ScheduleError::Closed(t.job),
        })
    }
}

pub(crate) fn retry_channel(capacity: usize) -> (RetryHandle, mpsc::Receiver<TimedJob>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (RetryHandle { tx }, rx)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Hold parked jobs until due, then push them onto the delivery queue.
///
/// At most `capacity` jobs are held; due jobs that find the queue full are
/// dropped. Everything still parked at shutdown is abandoned.
pub(crate) async fn scheduler_loop(
    mut rx: mpsc::Receiver<TimedJob>,
    queue: mpsc::Sender<DeliveryJob>,
    capacity: usize,
    stats: Arc<DispatcherStats>,
    shutdown: CancellationToken,
) {
    let mut heap: BinaryHeap<TimedJob> = BinaryHeap::new();

    loop {
        let next_ready = heap.peek().map(|t| t.ready_at);

        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            incoming = rx.recv() => match incoming {
                Some(timed) if heap.len() < capacity.max(1) => heap.push(timed),
                Some(timed) => {
                    warn!(
                        endpoint = %timed.job.endpoint_url,
                        session_id = %timed.job.session_id,
                        "Retry heap full, dropping job"
                    );
                    stats.incr_endpoint(Counter::RetryQueueFull, &timed.job.endpoint_url);
                }
                None => break,
            },
            () = sleep_until_opt(next_ready) => {}
        }

        let now = Instant::now();
        while heap.peek().is_some_and(|t| t.ready_at <= now) {
            let Some(timed) = heap.pop() else { break };
            match queue.try_send(timed.job) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(job)) => {
                    warn!(
                        endpoint = %job.endpoint_url,
                        session_id = %job.session_id,
                        attempt = job.attempt,
                        "Delivery queue full, dropping retry"
                    );
                    stats.incr_endpoint(Counter::RetryQueueFull, &job.endpoint_url);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }

    if !heap.is_empty() {
        debug!(abandoned = heap.len(), "Retry scheduler stopping with parked jobs");
        for timed in heap.drain() {
            stats.incr_endpoint(Counter::Abandoned, &timed.job.endpoint_url);
        }
    }
}
