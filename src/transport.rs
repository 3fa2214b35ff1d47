//! Outbound HTTP delivery.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::Serialize;

use crate::error::FailureReason;
use crate::signing::{self, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::types::DeliveryJob;

/// A fully built POST, ready to go on the wire.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub url: String,
    pub body: Bytes,
    pub headers: Vec<(&'static str, String)>,
    pub timeout: Duration,
}

/// Sends a delivery request. `Ok` carries the 2xx status code.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, request: DeliveryRequest) -> Result<u16, FailureReason>;
}

/// JSON body posted to every endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEnvelope<'a> {
    pub session_id: &'a str,
    pub event: &'a str,
    /// Unix seconds at which the event was accepted for delivery.
    pub timestamp: i64,
    pub data: serde_json::Value,
}

impl<'a> WebhookEnvelope<'a> {
    pub fn from_job(job: &'a DeliveryJob) -> Self {
        Self {
            session_id: &job.session_id,
            event: &job.event_type,
            timestamp: job.enqueued_at.timestamp(),
            data: payload_to_data(&job.payload),
        }
    }
}

/// JSON payloads are embedded as-is, anything else as a string.
fn payload_to_data(payload: &[u8]) -> serde_json::Value {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return serde_json::Value::Object(serde_json::Map::new());
    }
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(payload).into_owned()))
}

/// Build the request for one attempt of `job`, signing it if the job has a secret.
pub fn build_request(job: &DeliveryJob, timeout: Duration) -> Result<DeliveryRequest, serde_json::Error> {
    let body = Bytes::from(serde_json::to_vec(&WebhookEnvelope::from_job(job))?);

    let mut headers = Vec::with_capacity(2);
    if let Some(secret) = job.secret.as_deref() {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        headers.push((SIGNATURE_HEADER, signing::sign_payload(secret, &timestamp, &body)));
        headers.push((TIMESTAMP_HEADER, timestamp));
    }

    Ok(DeliveryRequest {
        url: job.endpoint_url.clone(),
        body,
        headers,
        timeout,
    })
}

/// `reqwest`-backed transport sharing one connection pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    user_agent: String,
}

impl HttpTransport {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), user_agent)
    }

    pub fn with_client(client: reqwest::Client, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, request: DeliveryRequest) -> Result<u16, FailureReason> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, &self.user_agent);

        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }

        match builder.body(request.body).send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    Ok(status.as_u16())
                } else {
                    Err(FailureReason::Status(status.as_u16()))
                }
            }
            Err(err) if err.is_timeout() => Err(FailureReason::Timeout),
            Err(_) => Err(FailureReason::Network),
        }
    }
}
