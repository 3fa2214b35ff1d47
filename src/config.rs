//! Dispatcher configuration.
//!
//! Every knob has a default; `from_env` overrides them from `WEBHOOK_*`
//! environment variables. Unparseable values fall back to the default.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::InvalidOpenCircuitPolicy;
use crate::rate_limiter::RateLimitConfig;

/// What a worker does with a job whose endpoint circuit is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenCircuitPolicy {
    /// Discard the job immediately.
    Drop,
    /// Put the job back after `retry_delay` while retry budget remains.
    #[default]
    Reschedule,
}

impl FromStr for OpenCircuitPolicy {
    type Err = InvalidOpenCircuitPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "reschedule" => Ok(Self::Reschedule),
            _ => Err(InvalidOpenCircuitPolicy(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound for a single HTTP delivery attempt.
    pub timeout: Duration,
    /// Attempts allowed per job, counting the first one.
    pub max_retries: u32,
    /// Backoff unit; attempt `n` waits `retry_delay * n`.
    pub retry_delay: Duration,
    pub worker_count: usize,
    /// Capacity of the shared delivery queue.
    pub queue_size: usize,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub open_circuit_policy: OpenCircuitPolicy,
    pub user_agent: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            worker_count: 10,
            queue_size: 1_000,
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            open_circuit_policy: OpenCircuitPolicy::default(),
            user_agent: concat!("session-webhook-dispatcher/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from `WEBHOOK_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());

        Self {
            timeout: Duration::from_secs(parse_or(
                get("WEBHOOK_TIMEOUT_SECS"),
                defaults.timeout.as_secs(),
            )),
            max_retries: parse_or(get("WEBHOOK_MAX_RETRIES"), defaults.max_retries),
            retry_delay: Duration::from_millis(parse_or(
                get("WEBHOOK_RETRY_DELAY_MS"),
                defaults.retry_delay.as_millis() as u64,
            )),
            worker_count: parse_or(get("WEBHOOK_WORKER_COUNT"), defaults.worker_count),
            queue_size: parse_or(get("WEBHOOK_QUEUE_SIZE"), defaults.queue_size),
            circuit_breaker: CircuitBreakerConfig {
                max_failures: parse_or(
                    get("WEBHOOK_CB_MAX_FAILURES"),
                    defaults.circuit_breaker.max_failures,
                ),
                reset_timeout: Duration::from_secs(parse_or(
                    get("WEBHOOK_CB_RESET_TIMEOUT_SECS"),
                    defaults.circuit_breaker.reset_timeout.as_secs(),
                )),
                half_open_max_calls: parse_or(
                    get("WEBHOOK_CB_HALF_OPEN_MAX_CALLS"),
                    defaults.circuit_breaker.half_open_max_calls,
                ),
            },
            rate_limit: RateLimitConfig {
                requests_per_second: parse_or(
                    get("WEBHOOK_RATE_LIMIT_RPS"),
                    defaults.rate_limit.requests_per_second,
                ),
                burst_size: parse_or(
                    get("WEBHOOK_RATE_LIMIT_BURST"),
                    defaults.rate_limit.burst_size,
                ),
                cleanup_interval: Duration::from_secs(parse_or(
                    get("WEBHOOK_RATE_LIMIT_CLEANUP_SECS"),
                    defaults.rate_limit.cleanup_interval.as_secs(),
                )),
            },
            open_circuit_policy: match get("WEBHOOK_OPEN_CIRCUIT_POLICY").map(|v| v.parse()) {
                Some(Ok(policy)) => policy,
                Some(Err(e)) => {
                    warn!(error = %e, "Ignoring WEBHOOK_OPEN_CIRCUIT_POLICY");
                    defaults.open_circuit_policy
                }
                None => defaults.open_circuit_policy,
            },
            user_agent: get("WEBHOOK_USER_AGENT")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.user_agent),
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}
