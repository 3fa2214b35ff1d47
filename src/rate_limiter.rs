//! Per-endpoint token buckets.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sustained refill rate, in tokens per second.
    pub requests_per_second: f64,
    /// Bucket capacity.
    pub burst_size: u32,
    /// Period of the idle-bucket sweep.
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst_size: 20,
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Token bucket rate limiter.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub capacity: f64,
    pub tokens: f64,
    pub refill_per_sec: f64,
    pub last_refill_age_ms: u64,
}

impl TokenBucket {
    /// A full bucket. Non-positive rates are clamped so the bucket always refills.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let cap = f64::from(capacity.max(1));
        Self {
            capacity: cap,
            tokens: cap,
            refill_per_sec: if refill_per_sec > 0.0 { refill_per_sec } else { 1.0 },
            last_refill: Instant::now(),
        }
    }

    /// Credit tokens for the time since the last call, capped at capacity,
    /// then spend one if a whole token is available.
    pub fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let refill = elapsed * self.refill_per_sec;
        self.tokens = (self.tokens + refill).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_refill)
    }

    pub fn snapshot(&self) -> RateLimiterStats {
        let age = Instant::now().duration_since(self.last_refill).as_millis() as u64;
        RateLimiterStats {
            capacity: self.capacity,
            tokens: self.tokens,
            refill_per_sec: self.refill_per_sec,
            last_refill_age_ms: age,
        }
    }
}

/// Buckets keyed by endpoint URL, created lazily on first use.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Take one token for `endpoint` if one is available. Never waits.
    pub fn try_acquire(&self, endpoint: &str) -> bool {
        if let Some(mut bucket) = self.buckets.get_mut(endpoint) {
            return bucket.try_take();
        }

        self.buckets
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                TokenBucket::new(self.config.burst_size, self.config.requests_per_second)
            })
            .try_take()
    }

    /// Drop buckets idle for longer than `max_idle`. Returns how many went.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.idle_for(now) <= max_idle);
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn stats(&self) -> Vec<(String, RateLimiterStats)> {
        self.buckets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

/// Longest sweep period; larger configured intervals are clamped to this.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(86_400 * 365);

/// Periodically remove idle buckets until `shutdown` fires.
///
/// A bucket is idle once untouched for two cleanup intervals.
pub async fn sweep_loop(limiter: Arc<RateLimiter>, shutdown: CancellationToken) {
    let interval = limiter
        .config
        .cleanup_interval
        .clamp(Duration::from_millis(1), MAX_SWEEP_INTERVAL);
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = limiter.sweep(interval.saturating_mul(2));
                if removed > 0 {
                    debug!(removed, remaining = limiter.len(), "Swept idle rate limit buckets");
                }
            }
        }
    }
}
