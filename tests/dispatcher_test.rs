use std::sync::Arc;
use std::time::Duration;

use session_webhook_dispatcher::{
    verify_webhook_request, CircuitBreakerConfig, CircuitState, DispatchError, DispatchOutcome,
    Dispatcher, DispatcherConfig, InMemorySubscriptions, OpenCircuitPolicy, SkipReason,
    StatsSnapshot, WebhookSubscription,
};
use tokio::time::Instant;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config() -> DispatcherConfig {
    DispatcherConfig {
        timeout: Duration::from_secs(2),
        worker_count: 2,
        queue_size: 16,
        retry_delay: Duration::from_millis(20),
        ..Default::default()
    }
}

fn subscriptions(sub: WebhookSubscription) -> Arc<InMemorySubscriptions> {
    let store = Arc::new(InMemorySubscriptions::new());
    store.upsert(sub).unwrap();
    store
}

async fn wait_for(dispatcher: &Dispatcher, done: impl Fn(&StatsSnapshot) -> bool) -> StatsSnapshot {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = dispatcher.stats();
        if done(&stats) {
            return stats;
        }
        assert!(Instant::now() < deadline, "timed out waiting, stats: {stats:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn delivers_only_subscribed_events() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/hook", server.uri());
    let dispatcher = Dispatcher::new(
        config(),
        subscriptions(WebhookSubscription::new("s1", &url).with_events("messages")),
    );
    dispatcher.start().unwrap();

    assert_eq!(
        dispatcher.dispatch("s1", "message", r#"{"id":"m1","text":"hi"}"#),
        Ok(DispatchOutcome::Enqueued)
    );
    assert_eq!(
        dispatcher.dispatch("s1", "group.create", "{}"),
        Ok(DispatchOutcome::Skipped(SkipReason::Filtered))
    );

    wait_for(&dispatcher, |s| s.delivered == 1).await;
    dispatcher.stop(Duration::from_secs(1)).await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);

    let body: serde_json::Value = requests[0].body_json().unwrap();
    assert_eq!(body["sessionId"], "s1");
    assert_eq!(body["event"], "message");
    assert_eq!(body["data"]["text"], "hi");
    assert!(body["timestamp"].is_i64());
    assert_eq!(
        requests[0].headers.get("content-type").unwrap().to_str().unwrap(),
        "application/json"
    );
}

#[tokio::test]
async fn failing_endpoint_opens_circuit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let url = format!("{}/hook", server.uri());
    let dispatcher = Dispatcher::new(
        DispatcherConfig {
            worker_count: 1,
            max_retries: 1,
            open_circuit_policy: OpenCircuitPolicy::Drop,
            circuit_breaker: CircuitBreakerConfig {
                max_failures: 5,
                reset_timeout: Duration::from_secs(30),
                half_open_max_calls: 1,
            },
            ..config()
        },
        subscriptions(WebhookSubscription::new("s1", &url).with_events("*")),
    );
    dispatcher.start().unwrap();

    for _ in 0..5 {
        dispatcher.dispatch("s1", "message", "{}").unwrap();
    }
    wait_for(&dispatcher, |s| s.retries_exhausted == 5).await;
    assert_eq!(dispatcher.circuit_state(&url), CircuitState::Open);

    dispatcher.dispatch("s1", "message", "{}").unwrap();
    let stats = wait_for(&dispatcher, |s| s.circuit_dropped == 1).await;
    assert_eq!(stats.attempts, 5);
    assert_eq!(server.received_requests().await.unwrap().len(), 5);

    dispatcher.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let url = format!("{}/hook", server.uri());
    let dispatcher = Dispatcher::new(
        DispatcherConfig {
            max_retries: 3,
            ..config()
        },
        subscriptions(WebhookSubscription::new("s1", &url).with_events("all")),
    );
    dispatcher.start().unwrap();

    dispatcher.dispatch("s1", "receipt", "{}").unwrap();
    let stats = wait_for(&dispatcher, |s| s.delivered == 1).await;

    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.failed_attempts, 2);
    assert_eq!(stats.retries_scheduled, 2);
    assert_eq!(dispatcher.circuit_state(&url), CircuitState::Closed);

    dispatcher.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn slow_endpoint_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let url = format!("{}/hook", server.uri());
    let dispatcher = Dispatcher::new(
        DispatcherConfig {
            timeout: Duration::from_millis(100),
            max_retries: 1,
            ..config()
        },
        subscriptions(WebhookSubscription::new("s1", &url).with_events("messages")),
    );
    dispatcher.start().unwrap();

    dispatcher.dispatch("s1", "message", "{}").unwrap();
    let stats = wait_for(&dispatcher, |s| s.retries_exhausted == 1).await;
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.failed_attempts, 1);

    dispatcher.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn signed_deliveries_verify() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let url = format!("{}/hook", server.uri());
    let dispatcher = Dispatcher::new(
        config(),
        subscriptions(
            WebhookSubscription::new("s1", &url)
                .with_events("connection")
                .with_secret(b"supersecret".to_vec()),
        ),
    );
    dispatcher.start().unwrap();

    dispatcher.dispatch("s1", "connected", "{}").unwrap();
    wait_for(&dispatcher, |s| s.delivered == 1).await;
    dispatcher.stop(Duration::from_secs(1)).await;

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let headers: Vec<(String, String)> = request
        .headers
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), value.to_str().unwrap().to_string()))
        .collect();

    let now = chrono::Utc::now().timestamp() as u64;
    verify_webhook_request(
        headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        &request.body,
        b"supersecret",
        300,
        now,
    )
    .unwrap();

    assert!(verify_webhook_request(
        headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        &request.body,
        b"wrong",
        300,
        now,
    )
    .is_err());
}

#[tokio::test]
async fn stop_deadline_abandons_queued_jobs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(1)))
        .mount(&server)
        .await;

    let url = format!("{}/hook", server.uri());
    let dispatcher = Dispatcher::new(
        DispatcherConfig {
            worker_count: 1,
            queue_size: 2,
            ..config()
        },
        subscriptions(WebhookSubscription::new("s1", &url).with_events("messages")),
    );
    dispatcher.start().unwrap();

    // Single-threaded runtime: nothing is consumed until this task yields.
    let outcomes: Vec<_> = (0..10)
        .map(|_| dispatcher.dispatch("s1", "message", "{}"))
        .collect();
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 2);
    assert!(outcomes
        .iter()
        .filter(|o| o.is_err())
        .all(|o| *o == Err(DispatchError::QueueFull)));

    let started = Instant::now();
    dispatcher.stop(Duration::from_millis(100)).await;
    assert!(started.elapsed() < Duration::from_millis(900));

    // One job in flight when the worker was aborted, one still queued.
    let stats = dispatcher.stats();
    assert_eq!(stats.dropped_queue_full, 8);
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.abandoned, 2);
    assert_eq!(
        dispatcher.dispatch("s1", "message", "{}"),
        Err(DispatchError::NotRunning)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_deadline_counts_every_undelivered_job() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(1)))
        .mount(&server)
        .await;

    let url = format!("{}/hook", server.uri());

    for round in 0..5 {
        let dispatcher = Dispatcher::new(
            DispatcherConfig {
                worker_count: 1,
                queue_size: 8,
                ..config()
            },
            subscriptions(WebhookSubscription::new("s1", &url).with_events("messages")),
        );
        dispatcher.start().unwrap();

        for _ in 0..8 {
            assert_eq!(
                dispatcher.dispatch("s1", "message", "{}"),
                Ok(DispatchOutcome::Enqueued)
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.stop(Duration::from_millis(100)).await;

        let stats = dispatcher.stats();
        assert_eq!(stats.enqueued, 8, "round {round}");
        assert_eq!(stats.delivered, 0, "round {round}");
        assert_eq!(stats.abandoned, 8, "round {round}: {stats:?}");
        assert_eq!(dispatcher.queue_len(), 0);
    }
}
