use std::sync::Arc;
use std::time::Duration;

use session_webhook_dispatcher::{
    Dispatcher, DispatcherConfig, EventSink, InMemorySubscriptions, WebhookSubscription,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let subscriptions = Arc::new(InMemorySubscriptions::new());
    subscriptions.upsert(
        WebhookSubscription::new("session-a", "https://example.com/webhook")
            .with_events("messages,connection,call.*")
            .with_secret(b"supersecret".to_vec()),
    )?;

    let dispatcher = Dispatcher::new(DispatcherConfig::from_env(), subscriptions);
    dispatcher.start()?;

    let outcome = dispatcher.dispatch("session-a", "message", r#"{"id":"m1","text":"hello"}"#)?;
    tracing::info!(?outcome, "dispatched message");

    let outcome = dispatcher.dispatch("session-a", "presence", "{}")?;
    tracing::info!(?outcome, "dispatched presence");

    dispatcher.on_event("session-a", "call.offer", r#"{"from":"alice"}"#.into());

    dispatcher.stop(Duration::from_secs(5)).await;
    tracing::info!(stats = ?dispatcher.stats(), "done");
    Ok(())
}
