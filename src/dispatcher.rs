use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitState, EndpointHealthSnapshot};
use crate::config::DispatcherConfig;
use crate::error::{DispatchError, DispatchOutcome, SkipReason, StartError};
use crate::filter;
use crate::rate_limiter::{self, RateLimiter, RateLimiterStats};
use crate::retry::{self, RetryPolicy, TimedJob};
use crate::stats::{Counter, DispatcherStats, StatsSnapshot};
use crate::subscriptions::SubscriptionStore;
use crate::transport::{HttpTransport, Transport};
use crate::types::DeliveryJob;
use crate::worker::{worker_loop, WorkerContext};

/// Receives events from the protocol client layer. Must not block.
pub trait EventSink: Send + Sync {
    fn on_event(&self, session_id: &str, event_type: &str, payload: Bytes);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Created = 0,
    Running = 1,
    Stopped = 2,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Created,
            1 => State::Running,
            _ => State::Stopped,
        }
    }
}

/// Parts handed to background tasks at `start`.
struct Lifecycle {
    queue_rx: Option<mpsc::Receiver<DeliveryJob>>,
    retry_rx: Option<mpsc::Receiver<TimedJob>>,
    /// Kept so the queue outlives aborted workers and can be counted at stop.
    shared_rx: Option<Arc<AsyncMutex<mpsc::Receiver<DeliveryJob>>>>,
    handles: Vec<JoinHandle<()>>,
}

/// Entry point of the webhook subsystem.
///
/// `dispatch` runs in the caller's context and only ever attempts a
/// non-blocking enqueue; everything involving the network happens on the
/// worker pool spawned by `start`.
pub struct Dispatcher {
    config: DispatcherConfig,
    subscriptions: Arc<dyn SubscriptionStore>,
    queue_tx: mpsc::Sender<DeliveryJob>,
    state: AtomicU8,
    lifecycle: Mutex<Lifecycle>,
    ctx: Arc<WorkerContext>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Dispatcher delivering over HTTP with a shared `reqwest` client.
    pub fn new(config: DispatcherConfig, subscriptions: Arc<dyn SubscriptionStore>) -> Self {
        let transport = Arc::new(HttpTransport::new(config.user_agent.clone()));
        Self::with_transport(config, subscriptions, transport)
    }

    pub fn with_transport(
        config: DispatcherConfig,
        subscriptions: Arc<dyn SubscriptionStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let queue_size = config.queue_size.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(queue_size);
        let (retries, retry_rx) = retry::retry_channel(queue_size);

        let ctx = Arc::new(WorkerContext {
            timeout: config.timeout,
            retry_policy: RetryPolicy {
                max_retries: config.max_retries,
                retry_delay: config.retry_delay,
            },
            open_circuit_policy: config.open_circuit_policy,
            breaker: Arc::new(CircuitBreaker::new(config.circuit_breaker.clone())),
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            transport,
            retries,
            stats: Arc::new(DispatcherStats::default()),
        });

        Self {
            config,
            subscriptions,
            queue_tx,
            state: AtomicU8::new(State::Created as u8),
            lifecycle: Mutex::new(Lifecycle {
                queue_rx: Some(queue_rx),
                retry_rx: Some(retry_rx),
                shared_rx: None,
                handles: Vec::new(),
            }),
            ctx,
            shutdown: CancellationToken::new(),
        }
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Spawn the worker pool, the retry scheduler and the rate limiter sweep.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), StartError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            error!("No tokio runtime, webhook delivery is unavailable");
            StartError::NoRuntime
        })?;

        let mut lifecycle = self.lifecycle.lock();
        match self.state() {
            State::Created => {}
            State::Running => return Err(StartError::AlreadyStarted),
            State::Stopped => return Err(StartError::Stopped),
        }

        let (Some(queue_rx), Some(retry_rx)) =
            (lifecycle.queue_rx.take(), lifecycle.retry_rx.take())
        else {
            return Err(StartError::Stopped);
        };

        let prewarmed = self.prewarm();

        let worker_count = if self.config.worker_count == 0 {
            warn!("Worker count of 0 configured, starting a single worker");
            1
        } else {
            self.config.worker_count
        };

        let shared_rx = Arc::new(AsyncMutex::new(queue_rx));
        for _ in 0..worker_count {
            lifecycle.handles.push(runtime.spawn(worker_loop(
                shared_rx.clone(),
                self.ctx.clone(),
                self.shutdown.clone(),
            )));
        }
        lifecycle.shared_rx = Some(shared_rx);

        lifecycle.handles.push(runtime.spawn(retry::scheduler_loop(
            retry_rx,
            self.queue_tx.clone(),
            self.config.queue_size.max(1),
            self.ctx.stats.clone(),
            self.shutdown.clone(),
        )));

        lifecycle.handles.push(runtime.spawn(rate_limiter::sweep_loop(
            self.ctx.limiter.clone(),
            self.shutdown.clone(),
        )));

        self.state.store(State::Running as u8, Ordering::Release);

        info!(
            workers = worker_count,
            queue_size = self.config.queue_size,
            subscriptions = prewarmed,
            "Webhook dispatcher started"
        );
        Ok(())
    }

    /// Validate known subscriptions and register their endpoints.
    fn prewarm(&self) -> usize {
        let mut ready = 0;
        for sub in self.subscriptions.list_enabled_subscriptions() {
            if let Err(e) = filter::validate_patterns(sub.event_patterns.iter().map(String::as_str)) {
                warn!(
                    session_id = %sub.session_id,
                    error = %e,
                    "Subscription has invalid event patterns"
                );
                continue;
            }
            if sub.is_deliverable() {
                self.ctx.breaker.track(&sub.endpoint_url);
                ready += 1;
            }
        }
        ready
    }

    /// Route one event to its session's webhook, if any.
    ///
    /// Never blocks and never performs I/O. A full queue drops the event and
    /// reports [`DispatchError::QueueFull`]; nothing is retried here.
    pub fn dispatch(
        &self,
        session_id: &str,
        event_type: &str,
        payload: impl Into<Bytes>,
    ) -> Result<DispatchOutcome, DispatchError> {
        if self.state() != State::Running {
            self.ctx.stats.incr(Counter::NotRunning);
            return Err(DispatchError::NotRunning);
        }

        let Some(subscription) = self
            .subscriptions
            .get_subscription(session_id)
            .filter(|sub| sub.is_deliverable())
        else {
            self.ctx.stats.incr(Counter::NoSubscription);
            return Ok(DispatchOutcome::Skipped(SkipReason::NoSubscription));
        };

        if !subscription.selects(event_type) {
            self.ctx.stats.incr(Counter::Filtered);
            return Ok(DispatchOutcome::Skipped(SkipReason::Filtered));
        }

        let job = DeliveryJob::new(&subscription, event_type, payload.into());

        match self.queue_tx.try_send(job) {
            Ok(()) => {
                self.ctx.stats.incr(Counter::Enqueued);
                Ok(DispatchOutcome::Enqueued)
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(
                    session_id = %job.session_id,
                    endpoint = %job.endpoint_url,
                    event_type = %job.event_type,
                    queue_size = self.config.queue_size,
                    "Webhook queue full, dropping event"
                );
                self.ctx.stats.incr_endpoint(Counter::QueueFull, &job.endpoint_url);
                Err(DispatchError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.ctx.stats.incr(Counter::NotRunning);
                Err(DispatchError::NotRunning)
            }
        }
    }

    /// Stop accepting events and wait up to `deadline` for the workers to
    /// drain the queue. Whatever is still queued or in flight afterwards is
    /// abandoned.
    pub async fn stop(&self, deadline: Duration) {
        let (mut handles, shared_rx) = {
            let mut lifecycle = self.lifecycle.lock();
            let previous = State::from_u8(self.state.swap(State::Stopped as u8, Ordering::AcqRel));
            if previous == State::Stopped {
                return;
            }
            (std::mem::take(&mut lifecycle.handles), lifecycle.shared_rx.take())
        };

        self.shutdown.cancel();

        let mut joined = 0;
        let drained = tokio::time::timeout(deadline, async {
            for handle in handles.iter_mut() {
                log_join_error(handle.await);
                joined += 1;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                deadline_ms = deadline.as_millis() as u64,
                "Webhook dispatcher stop deadline reached, abandoning in-flight deliveries"
            );
            let pending = &mut handles[joined..];
            for handle in pending.iter() {
                handle.abort();
            }
            // Aborted workers count their in-flight job when dropped.
            for handle in pending.iter_mut() {
                log_join_error(handle.await);
            }
        }

        let mut leftover = 0;
        if let Some(shared_rx) = shared_rx {
            let mut rx = shared_rx.lock().await;
            while let Ok(job) = rx.try_recv() {
                self.ctx.stats.incr_endpoint(Counter::Abandoned, &job.endpoint_url);
                leftover += 1;
            }
        }

        info!(
            queued_abandoned = leftover,
            abandoned_total = self.ctx.stats.snapshot().abandoned,
            "Webhook dispatcher stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    /// Jobs currently waiting in the delivery queue.
    pub fn queue_len(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn circuit_state(&self, endpoint_url: &str) -> CircuitState {
        self.ctx.breaker.state(endpoint_url)
    }

    pub fn endpoint_health(&self, endpoint_url: &str) -> Option<EndpointHealthSnapshot> {
        self.ctx.breaker.snapshot(endpoint_url)
    }

    pub fn rate_limiter_stats(&self) -> Vec<(String, RateLimiterStats)> {
        self.ctx.limiter.stats()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Webhook background task panicked");
        }
    }
}

impl EventSink for Dispatcher {
    fn on_event(&self, session_id: &str, event_type: &str, payload: Bytes) {
        // Outcomes are already logged and counted.
        let _ = self.dispatch(session_id, event_type, payload);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
