//! Per-endpoint circuit breaker.
//!
//! Tracks consecutive delivery failures for each endpoint URL and stops
//! attempts to endpoints that keep failing. After `reset_timeout` the
//! endpoint is probed with a bounded number of concurrent requests; one
//! successful probe closes the circuit again, one failed probe reopens it.
//!
//! Every admission hands out a [`CircuitPermit`] stamped with the state
//! generation it was issued in. Results reported with a permit from an older
//! generation are ignored, so a slow request started before a transition can
//! never undo it.

use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; deliveries proceed.
    #[default]
    Closed,
    /// Tripped; deliveries are skipped until the reset timeout elapses.
    Open,
    /// Probing recovery with a limited number of requests.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub max_failures: u32,
    /// Time spent open before probing.
    pub reset_timeout: Duration,
    /// Concurrent probes allowed while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

/// Proof of admission for one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitPermit {
    generation: u64,
    probe: bool,
}

impl CircuitPermit {
    /// Whether this attempt is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

#[derive(Debug, Default)]
struct EndpointHealth {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    generation: u64,
}

impl EndpointHealth {
    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probes_in_flight = 0;
        self.generation += 1;
    }

    fn half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.consecutive_failures = 0;
        self.probes_in_flight = 0;
        self.generation += 1;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probes_in_flight = 0;
        self.generation += 1;
    }
}

/// Point-in-time view of one endpoint's health.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealthSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub probes_in_flight: u32,
    /// Time since the circuit last opened, if it is not closed.
    #[serde(skip)]
    pub open_for: Option<Duration>,
}

/// Registry of circuit breakers keyed by endpoint URL.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    endpoints: DashMap<String, EndpointHealth>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            endpoints: DashMap::new(),
        }
    }

    /// Ask whether an attempt to `endpoint` may go out now.
    ///
    /// Moves an open circuit to half-open once the reset timeout has elapsed.
    /// Returns `None` while open or when the probe budget is used up.
    pub fn try_acquire(&self, endpoint: &str) -> Option<CircuitPermit> {
        if let Some(mut health) = self.endpoints.get_mut(endpoint) {
            return self.admit(endpoint, &mut health);
        }
        let mut health = self.endpoints.entry(endpoint.to_string()).or_default();
        self.admit(endpoint, &mut health)
    }

    fn admit(&self, endpoint: &str, health: &mut EndpointHealth) -> Option<CircuitPermit> {
        let now = Instant::now();

        if health.state == CircuitState::Open {
            let elapsed = health
                .opened_at
                .map(|opened| now.saturating_duration_since(opened))
                .unwrap_or(Duration::MAX);
            if elapsed < self.config.reset_timeout {
                return None;
            }
            health.half_open();
            info!(
                target: "circuit_breaker",
                endpoint,
                "Circuit breaker half-open, probing endpoint"
            );
        }

        match health.state {
            CircuitState::Closed => Some(CircuitPermit {
                generation: health.generation,
                probe: false,
            }),
            CircuitState::HalfOpen => {
                if health.probes_in_flight >= self.config.half_open_max_calls.max(1) {
                    return None;
                }
                health.probes_in_flight += 1;
                Some(CircuitPermit {
                    generation: health.generation,
                    probe: true,
                })
            }
            CircuitState::Open => None,
        }
    }

    /// Report a successful delivery made under `permit`.
    pub fn record_success(&self, endpoint: &str, permit: CircuitPermit) {
        let Some(mut health) = self.endpoints.get_mut(endpoint) else {
            return;
        };
        if health.generation != permit.generation {
            return;
        }

        match health.state {
            CircuitState::Closed => health.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                health.close();
                info!(
                    target: "circuit_breaker",
                    endpoint,
                    "Circuit breaker closed after successful probe"
                );
            }
            CircuitState::Open => {}
        }
    }

    /// Report a failed delivery made under `permit`.
    pub fn record_failure(&self, endpoint: &str, permit: CircuitPermit) {
        let Some(mut health) = self.endpoints.get_mut(endpoint) else {
            return;
        };
        if health.generation != permit.generation {
            return;
        }

        match health.state {
            CircuitState::Closed => {
                health.consecutive_failures = health.consecutive_failures.saturating_add(1);
                if health.consecutive_failures >= self.config.max_failures.max(1) {
                    let failures = health.consecutive_failures;
                    health.trip(Instant::now());
                    warn!(
                        target: "circuit_breaker",
                        endpoint,
                        failures,
                        threshold = self.config.max_failures,
                        "Circuit breaker opened due to consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                health.trip(Instant::now());
                warn!(
                    target: "circuit_breaker",
                    endpoint,
                    "Circuit breaker reopened after failed probe"
                );
            }
            CircuitState::Open => {}
        }
    }

    /// Give back a permit that did not lead to a request.
    pub fn release(&self, endpoint: &str, permit: CircuitPermit) {
        if !permit.probe {
            return;
        }
        if let Some(mut health) = self.endpoints.get_mut(endpoint) {
            if health.generation == permit.generation && health.state == CircuitState::HalfOpen {
                health.probes_in_flight = health.probes_in_flight.saturating_sub(1);
            }
        }
    }

    /// Stored state for `endpoint`; unknown endpoints are closed.
    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.endpoints
            .get(endpoint)
            .map(|h| h.state)
            .unwrap_or_default()
    }

    pub fn snapshot(&self, endpoint: &str) -> Option<EndpointHealthSnapshot> {
        let now = Instant::now();
        self.endpoints.get(endpoint).map(|h| EndpointHealthSnapshot {
            state: h.state,
            consecutive_failures: h.consecutive_failures,
            probes_in_flight: h.probes_in_flight,
            open_for: h.opened_at.map(|at| now.saturating_duration_since(at)),
        })
    }

    /// Make sure `endpoint` has an entry, without changing its state.
    pub fn track(&self, endpoint: &str) {
        self.endpoints.entry(endpoint.to_string()).or_default();
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
