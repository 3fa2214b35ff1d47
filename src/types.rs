use std::collections::BTreeSet;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::filter;

/// A session's webhook: where to deliver and which events it wants.
///
/// Owned by the configuration store; the dispatcher only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub session_id: String,

    /// Target URL. An empty URL disables delivery.
    pub endpoint_url: String,

    /// Filter tokens, see [`crate::filter`].
    pub event_patterns: BTreeSet<String>,

    pub enabled: bool,

    /// Optional HMAC key for signing deliveries.
    #[serde(default, skip_serializing)]
    pub secret: Option<Vec<u8>>,
}

impl WebhookSubscription {
    /// An enabled subscription with no event patterns.
    pub fn new(session_id: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            endpoint_url: endpoint_url.into(),
            event_patterns: BTreeSet::new(),
            enabled: true,
            secret: None,
        }
    }

    /// Replace the patterns with the tokens of a comma-separated expression.
    pub fn with_events(mut self, expr: &str) -> Self {
        self.event_patterns = filter::parse_patterns(expr).into_iter().collect();
        self
    }

    pub fn with_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Enabled and pointing somewhere.
    pub fn is_deliverable(&self) -> bool {
        self.enabled && !self.endpoint_url.trim().is_empty()
    }

    pub fn selects(&self, event_type: &str) -> bool {
        filter::matches_patterns(event_type, self.event_patterns.iter().map(String::as_str))
    }
}

/// One event on its way to one endpoint.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub session_id: String,
    pub endpoint_url: String,
    pub event_type: String,
    pub payload: Bytes,

    /// Failed attempts so far.
    pub attempt: u32,

    pub enqueued_at: DateTime<Utc>,

    /// Times the job was put back because the circuit was open.
    pub deferrals: u32,

    pub secret: Option<Vec<u8>>,
}

impl DeliveryJob {
    pub fn new(subscription: &WebhookSubscription, event_type: &str, payload: Bytes) -> Self {
        Self {
            session_id: subscription.session_id.clone(),
            endpoint_url: subscription.endpoint_url.clone(),
            event_type: event_type.to_string(),
            payload,
            attempt: 0,
            enqueued_at: Utc::now(),
            deferrals: 0,
            secret: subscription.secret.clone(),
        }
    }
}
