use std::sync::Arc;

use dashmap::DashMap;

use crate::error::FilterError;
use crate::filter;
use crate::types::WebhookSubscription;

/// Read side of the webhook configuration.
///
/// Called on the dispatch path, so implementations must answer from memory
/// (a cache in front of the real store is fine) and never block on I/O.
pub trait SubscriptionStore: Send + Sync {
    fn get_subscription(&self, session_id: &str) -> Option<Arc<WebhookSubscription>>;

    /// Every enabled subscription; used at startup to pre-warm state.
    fn list_enabled_subscriptions(&self) -> Vec<Arc<WebhookSubscription>>;
}

/// In-memory subscription table.
///
/// Patterns are validated on write so that dispatch never sees an invalid
/// expression.
#[derive(Debug, Default)]
pub struct InMemorySubscriptions {
    by_session: DashMap<String, Arc<WebhookSubscription>>,
}

impl InMemorySubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the subscription for its session.
    pub fn upsert(&self, subscription: WebhookSubscription) -> Result<(), FilterError> {
        filter::validate_patterns(subscription.event_patterns.iter().map(String::as_str))?;
        self.by_session
            .insert(subscription.session_id.clone(), Arc::new(subscription));
        Ok(())
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<WebhookSubscription>> {
        self.by_session.remove(session_id).map(|(_, sub)| sub)
    }

    pub fn len(&self) -> usize {
        self.by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_session.is_empty()
    }
}

impl SubscriptionStore for InMemorySubscriptions {
    fn get_subscription(&self, session_id: &str) -> Option<Arc<WebhookSubscription>> {
        self.by_session.get(session_id).map(|entry| entry.value().clone())
    }

    fn list_enabled_subscriptions(&self) -> Vec<Arc<WebhookSubscription>> {
        self.by_session
            .iter()
            .filter(|entry| entry.value().enabled)
            .map(|entry| entry.value().clone())
            .collect()
    }
}
