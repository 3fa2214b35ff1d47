use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::OpenCircuitPolicy;
use crate::error::{DeliveryOutcome, DropReason, FailureReason};
use crate::rate_limiter::RateLimiter;
use crate::retry::{RetryHandle, RetryPolicy, ScheduleError};
use crate::stats::{Counter, DispatcherStats};
use crate::transport::{build_request, Transport};
use crate::types::DeliveryJob;

/// Shared context for all workers.
pub(crate) struct WorkerContext {
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub open_circuit_policy: OpenCircuitPolicy,
    pub breaker: Arc<CircuitBreaker>,
    pub limiter: Arc<RateLimiter>,
    pub transport: Arc<dyn Transport>,
    pub retries: RetryHandle,
    pub stats: Arc<DispatcherStats>,
}

/// Main worker loop.
///
/// Each worker:
/// - Pulls jobs from the shared queue
/// - Consults the endpoint's circuit breaker and rate limiter
/// - Hands failed jobs to the retry scheduler
/// - Drains what is left in the queue once shutdown is signalled
pub(crate) async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<DeliveryJob>>>,
    ctx: Arc<WorkerContext>,
    shutdown: CancellationToken,
) {
    loop {
        let job = {
            let mut guard = rx.lock().await;
            tokio::select! {
                biased;
                job = guard.recv() => job,
                () = shutdown.cancelled() => guard.try_recv().ok(),
            }
        };

        let Some(job) = job else { break };

        let in_flight = InFlight::new(&ctx.stats);
        process_job(job, &ctx).await;
        in_flight.finish();
    }
}

/// Counts the current job as abandoned if the worker is aborted mid-delivery.
struct InFlight<'a> {
    stats: &'a DispatcherStats,
    done: bool,
}

impl<'a> InFlight<'a> {
    fn new(stats: &'a DispatcherStats) -> Self {
        Self { stats, done: false }
    }

    fn finish(mut self) {
        self.done = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.stats.incr(Counter::Abandoned);
        }
    }
}

/// Run one pass of `job`: admission checks, then at most one HTTP attempt.
pub(crate) async fn process_job(job: DeliveryJob, ctx: &WorkerContext) -> DeliveryOutcome {
    let Some(permit) = ctx.breaker.try_acquire(&job.endpoint_url) else {
        return handle_circuit_open(job, ctx);
    };

    if !ctx.limiter.try_acquire(&job.endpoint_url) {
        // No request goes out, so the breaker is not charged.
        ctx.breaker.release(&job.endpoint_url, permit);
        ctx.stats.incr_endpoint(Counter::RateLimited, &job.endpoint_url);
        return handle_failure(job, FailureReason::RateLimited, ctx);
    }

    let request = match build_request(&job, ctx.timeout) {
        Ok(request) => request,
        Err(e) => {
            ctx.breaker.release(&job.endpoint_url, permit);
            error!(
                session_id = %job.session_id,
                event_type = %job.event_type,
                error = %e,
                "Failed to serialize webhook envelope"
            );
            return DeliveryOutcome::Dropped(DropReason::Unserializable);
        }
    };

    ctx.stats.incr_endpoint(Counter::Attempted, &job.endpoint_url);
    let started = Instant::now();
    let result = ctx.transport.deliver(request).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(status) => {
            ctx.breaker.record_success(&job.endpoint_url, permit);
            ctx.stats.incr_endpoint(Counter::Delivered, &job.endpoint_url);
            debug!(
                session_id = %job.session_id,
                endpoint = %job.endpoint_url,
                event_type = %job.event_type,
                attempt = job.attempt,
                status,
                latency_ms,
                "Webhook delivered"
            );
            DeliveryOutcome::Delivered
        }
        Err(reason) => {
            ctx.breaker.record_failure(&job.endpoint_url, permit);
            ctx.stats.incr_endpoint(Counter::AttemptFailed, &job.endpoint_url);
            debug!(
                session_id = %job.session_id,
                endpoint = %job.endpoint_url,
                event_type = %job.event_type,
                attempt = job.attempt,
                error = %reason,
                latency_ms,
                "Webhook delivery attempt failed"
            );
            handle_failure(job, reason, ctx)
        }
    }
}

/// Count the failure against the job and park it, or give up.
fn handle_failure(mut job: DeliveryJob, reason: FailureReason, ctx: &WorkerContext) -> DeliveryOutcome {
    job.attempt += 1;

    if !ctx.retry_policy.has_budget(job.attempt) {
        warn!(
            session_id = %job.session_id,
            endpoint = %job.endpoint_url,
            event_type = %job.event_type,
            attempts = job.attempt,
            error = %reason,
            "Webhook delivery exhausted all retries, dropping"
        );
        ctx.stats.incr_endpoint(Counter::RetriesExhausted, &job.endpoint_url);
        return DeliveryOutcome::Dropped(DropReason::RetriesExhausted(reason));
    }

    let delay = ctx.retry_policy.delay_for(job.attempt);
    match ctx.retries.schedule(job, delay) {
        Ok(()) => {
            ctx.stats.incr(Counter::RetryScheduled);
            DeliveryOutcome::Retrying(reason)
        }
        Err(e) => retry_rejected(e, ctx),
    }
}

/// Skip a job whose endpoint circuit is open. No request, no breaker charge.
fn handle_circuit_open(mut job: DeliveryJob, ctx: &WorkerContext) -> DeliveryOutcome {
    let may_wait = ctx.open_circuit_policy == OpenCircuitPolicy::Reschedule
        && ctx.retry_policy.has_budget(job.attempt)
        && job.deferrals < ctx.retry_policy.max_retries;

    if !may_wait {
        debug!(
            session_id = %job.session_id,
            endpoint = %job.endpoint_url,
            event_type = %job.event_type,
            "Circuit open, dropping webhook"
        );
        ctx.stats.incr_endpoint(Counter::CircuitOpenDropped, &job.endpoint_url);
        return DeliveryOutcome::Dropped(DropReason::CircuitOpen);
    }

    job.deferrals += 1;
    match ctx.retries.schedule(job, ctx.retry_policy.retry_delay) {
        Ok(()) => {
            ctx.stats.incr(Counter::Deferred);
            DeliveryOutcome::Deferred
        }
        Err(e) => retry_rejected(e, ctx),
    }
}

fn retry_rejected(err: ScheduleError, ctx: &WorkerContext) -> DeliveryOutcome {
    match err {
        ScheduleError::Full(job) => {
            warn!(
                session_id = %job.session_id,
                endpoint = %job.endpoint_url,
                attempt = job.attempt,
                "Retry scheduler full, dropping webhook"
            );
            ctx.stats.incr_endpoint(Counter::RetryQueueFull, &job.endpoint_url);
            DeliveryOutcome::Dropped(DropReason::RetryQueueFull)
        }
        ScheduleError::Closed(job) => {
            debug!(
                session_id = %job.session_id,
                endpoint = %job.endpoint_url,
                attempt = job.attempt,
                "Dispatcher stopping, abandoning webhook retry"
            );
            ctx.stats.incr_endpoint(Counter::Abandoned, &job.endpoint_url);
            DeliveryOutcome::Dropped(DropReason::Shutdown)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::rate_limiter::RateLimitConfig;
    use crate::retry::{retry_channel, TimedJob};
    use crate::transport::DeliveryRequest;
    use crate::types::WebhookSubscription;

    const URL: &str = "http://h/hook";

    struct ScriptedTransport {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn deliver(&self, _request: DeliveryRequest) -> Result<u16, FailureReason> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(FailureReason::Status(503))
            } else {
                Ok(200)
            }
        }
    }

    struct Harness {
        ctx: WorkerContext,
        transport: Arc<ScriptedTransport>,
        parked: mpsc::Receiver<TimedJob>,
    }

    fn harness(fail: bool, max_retries: u32, burst: u32, policy: OpenCircuitPolicy) -> Harness {
        let transport = Arc::new(ScriptedTransport {
            fail,
            calls: AtomicUsize::new(0),
        });
        let (retries, parked) = retry_channel(16);
        let ctx = WorkerContext {
            timeout: Duration::from_secs(1),
            retry_policy: RetryPolicy {
                max_retries,
                retry_delay: Duration::from_millis(100),
            },
            open_circuit_policy: policy,
            breaker: Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
                max_failures: 2,
                reset_timeout: Duration::from_secs(30),
                half_open_max_calls: 1,
            })),
            limiter: Arc::new(RateLimiter::new(RateLimitConfig {
                requests_per_second: 1.0,
                burst_size: burst,
                cleanup_interval: Duration::from_secs(60),
            })),
            transport: transport.clone(),
            retries,
            stats: Arc::new(DispatcherStats::default()),
        };
        Harness {
            ctx,
            transport,
            parked,
        }
    }

    fn job() -> DeliveryJob {
        DeliveryJob::new(&WebhookSubscription::new("s1", URL), "message", Bytes::from_static(b"{}"))
    }

    #[tokio::test]
    async fn success_resets_breaker_and_discards_job() {
        let mut h = harness(false, 3, 10, OpenCircuitPolicy::Reschedule);
        assert_eq!(process_job(job(), &h.ctx).await, DeliveryOutcome::Delivered);
        assert_eq!(h.transport.calls.load(Ordering::SeqCst), 1);
        assert!(h.parked.try_recv().is_err());
        assert_eq!(h.ctx.stats.snapshot().delivered, 1);
    }

    #[tokio::test]
    async fn failure_parks_job_with_incremented_attempt() {
        let mut h = harness(true, 3, 10, OpenCircuitPolicy::Reschedule);
        assert_eq!(
            process_job(job(), &h.ctx).await,
            DeliveryOutcome::Retrying(FailureReason::Status(503))
        );
        let parked = h.parked.try_recv().unwrap();
        assert_eq!(parked.job.attempt, 1);
        assert_eq!(h.ctx.breaker.snapshot(URL).unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn last_attempt_failure_is_terminal() {
        let mut h = harness(true, 1, 10, OpenCircuitPolicy::Reschedule);
        assert_eq!(
            process_job(job(), &h.ctx).await,
            DeliveryOutcome::Dropped(DropReason::RetriesExhausted(FailureReason::Status(503)))
        );
        assert!(h.parked.try_recv().is_err());
        assert_eq!(h.ctx.stats.snapshot().retries_exhausted, 1);
    }

    #[tokio::test]
    async fn open_circuit_skips_network() {
        let mut h = harness(true, 1, 10, OpenCircuitPolicy::Reschedule);
        process_job(job(), &h.ctx).await;
        process_job(job(), &h.ctx).await;
        assert_eq!(h.ctx.breaker.state(URL), CircuitState::Open);

        // Reschedule keeps the attempt count and only bumps deferrals.
        assert_eq!(process_job(job(), &h.ctx).await, DeliveryOutcome::Deferred);
        let parked = h.parked.try_recv().unwrap().job;
        assert_eq!((parked.attempt, parked.deferrals), (0, 1));

        // Deferral budget used up.
        assert_eq!(
            process_job(parked, &h.ctx).await,
            DeliveryOutcome::Dropped(DropReason::CircuitOpen)
        );
        assert_eq!(h.transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drop_policy_discards_immediately() {
        let h = harness(true, 3, 10, OpenCircuitPolicy::Drop);
        process_job(job(), &h.ctx).await;
        process_job(job(), &h.ctx).await;
        assert_eq!(
            process_job(job(), &h.ctx).await,
            DeliveryOutcome::Dropped(DropReason::CircuitOpen)
        );
        assert_eq!(h.ctx.stats.snapshot().circuit_dropped, 1);
    }

    #[tokio::test]
    async fn rate_limited_counts_as_attempt_without_request() {
        let mut h = harness(false, 3, 1, OpenCircuitPolicy::Reschedule);
        assert_eq!(process_job(job(), &h.ctx).await, DeliveryOutcome::Delivered);
        assert_eq!(
            process_job(job(), &h.ctx).await,
            DeliveryOutcome::Retrying(FailureReason::RateLimited)
        );
        assert_eq!(h.transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.parked.try_recv().unwrap().job.attempt, 1);
        assert_eq!(h.ctx.breaker.snapshot(URL).unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn retry_after_scheduler_exit_is_abandoned() {
        let h = harness(true, 3, 10, OpenCircuitPolicy::Reschedule);
        drop(h.parked);
        assert_eq!(
            process_job(job(), &h.ctx).await,
            DeliveryOutcome::Dropped(DropReason::Shutdown)
        );
        let stats = h.ctx.stats.snapshot();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.dropped_retry_queue_full, 0);
        assert_eq!(stats.retries_scheduled, 0);
    }

    #[tokio::test]
    async fn deferral_after_scheduler_exit_is_abandoned() {
        let Harness { ctx, parked, .. } = harness(true, 3, 10, OpenCircuitPolicy::Reschedule);
        drop(parked);
        for _ in 0..2 {
            let permit = ctx.breaker.try_acquire(URL).unwrap();
            ctx.breaker.record_failure(URL, permit);
        }
        assert_eq!(ctx.breaker.state(URL), CircuitState::Open);

        assert_eq!(
            process_job(job(), &ctx).await,
            DeliveryOutcome::Dropped(DropReason::Shutdown)
        );
        assert_eq!(ctx.stats.snapshot().abandoned, 1);
        assert_eq!(ctx.stats.snapshot().circuit_deferred, 0);
    }

    struct HangingTransport;

    #[async_trait]
    impl Transport for HangingTransport {
        async fn deliver(&self, _request: DeliveryRequest) -> Result<u16, FailureReason> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn aborted_worker_counts_in_flight_job() {
        let Harness { mut ctx, .. } = harness(false, 3, 10, OpenCircuitPolicy::Reschedule);
        ctx.transport = Arc::new(HangingTransport);
        let ctx = Arc::new(ctx);

        let (tx, rx) = mpsc::channel(4);
        tx.try_send(job()).unwrap();
        let worker = tokio::spawn(worker_loop(
            Arc::new(Mutex::new(rx)),
            ctx.clone(),
            CancellationToken::new(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ctx.stats.snapshot().attempts, 1);

        worker.abort();
        assert!(worker.await.unwrap_err().is_cancelled());
        assert_eq!(ctx.stats.snapshot().abandoned, 1);
    }

    #[tokio::test]
    async fn worker_drains_queue_after_shutdown() {
        let h = harness(false, 3, 10, OpenCircuitPolicy::Reschedule);
        let (tx, rx) = mpsc::channel(4);
        for _ in 0..3 {
            tx.try_send(job()).unwrap();
        }
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let ctx = Arc::new(h.ctx);
        worker_loop(Arc::new(Mutex::new(rx)), ctx.clone(), shutdown).await;
        assert_eq!(ctx.stats.snapshot().delivered, 3);
    }
}
