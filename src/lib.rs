//! Per-session webhook event dispatch.
//!
//! Events produced by messaging sessions are filtered against each
//! session's subscription and pushed onto a **bounded, in-memory** queue.
//! A fixed pool of workers posts them to the session's endpoint, guarded
//! by a per-endpoint circuit breaker and token-bucket rate limiter.
//!
//! ## Guarantees
//! - Dispatch never blocks the event producer
//! - Bounded resource usage with explicit drop-on-full backpressure
//! - Per-endpoint isolation of failures and throughput
//! - Best-effort, at-least-once delivery with linear retry backoff
//!
//! ## Non-Guarantees
//! - Durability across restarts
//! - Exactly-once delivery
//! - Ordering, even for a single endpoint
//! - Coordination between processes
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use session_webhook_dispatcher::{
//!     Dispatcher, DispatcherConfig, InMemorySubscriptions, WebhookSubscription,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let subscriptions = Arc::new(InMemorySubscriptions::new());
//! subscriptions.upsert(
//!     WebhookSubscription::new("session-1", "https://example.com/hook").with_events("messages"),
//! )?;
//!
//! let dispatcher = Dispatcher::new(DispatcherConfig::from_env(), subscriptions);
//! dispatcher.start()?;
//! dispatcher.dispatch("session-1", "message", r#"{"text":"hi"}"#)?;
//! dispatcher.stop(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod filter;
pub mod rate_limiter;
pub mod signing;

mod config;
mod dispatcher;
mod error;
mod retry;
mod stats;
mod subscriptions;
mod transport;
mod types;
mod worker;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitState, EndpointHealthSnapshot};
pub use config::{DispatcherConfig, OpenCircuitPolicy};
pub use dispatcher::{Dispatcher, EventSink};
pub use error::{
    DeliveryOutcome, DispatchError, DispatchOutcome, DropReason, FailureReason, FilterError,
    InvalidOpenCircuitPolicy, SkipReason, StartError,
};
pub use rate_limiter::{RateLimitConfig, RateLimiterStats};
pub use retry::{RetryPolicy, ScheduleError};
pub use signing::{
    is_timestamp_fresh, parse_signature_headers, sign_payload, verify_signature,
    verify_webhook_request, ParsedSignature, VerificationError, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
pub use stats::{DispatcherStats, StatsSnapshot};
pub use subscriptions::{InMemorySubscriptions, SubscriptionStore};
pub use transport::{build_request, DeliveryRequest, HttpTransport, Transport, WebhookEnvelope};
pub use types::{DeliveryJob, WebhookSubscription};
