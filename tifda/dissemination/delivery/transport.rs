use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use shared_event_bus::{EventPublisher, EventRecord};
use thiserror::Error;

use crate::format::FormattedMessage;

/// Failure of a single send attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The far end does not know this recipient; never retried.
    #[error("unknown recipient '{0}'")]
    UnknownRecipient(String),
    /// Server-side or network failure.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Request rejected for good.
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// Attempt exceeded its deadline.
    #[error("timed out after {0} ms")]
    Timeout(u64),
}

impl TransportError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Moves one formatted message to its recipient.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `message` once.
    async fn send(&self, message: &FormattedMessage) -> Result<(), TransportError>;
}

/// Publishes on the event bus, on the recipient topic with the message QoS.
#[derive(Clone)]
pub struct BrokerTransport {
    publisher: Arc<dyn EventPublisher>,
}

impl BrokerTransport {
    /// Wraps a publisher.
    #[must_use]
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self { publisher }
    }
}

impl std::fmt::Debug for BrokerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    async fn send(&self, message: &FormattedMessage) -> Result<(), TransportError> {
        let record = EventRecord::new(
            "dissemination",
            "dissemination.output",
            json!({
                "message_id": message.message_id,
                "recipient_id": message.recipient_id,
                "format": message.format,
                "content_type": message.format.content_type(),
                "body": message.body,
            }),
        )
        .on_topic(message.topic.clone(), message.qos);
        self.publisher
            .publish(record)
            .await
            .map_err(|err| TransportError::Transient(format!("{err:#}")))
    }
}

/// Point-to-point delivery over HTTP POST.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    timeout_ms: u64,
}

impl HttpTransport {
    /// Client posting to `endpoint` with a per-request timeout.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| TransportError::Permanent(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })
    }
}

fn classify_status(status: reqwest::StatusCode, recipient_id: &str) -> Result<(), TransportError> {
    if status.is_success() {
        Ok(())
    } else if status == reqwest::StatusCode::NOT_FOUND {
        Err(TransportError::UnknownRecipient(recipient_id.to_string()))
    } else if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        Err(TransportError::Transient(format!("recipient endpoint returned {status}")))
    } else {
        Err(TransportError::Permanent(format!("recipient endpoint returned {status}")))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, message: &FormattedMessage) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, message.format.content_type())
            .header("X-Tifda-Message-Id", message.message_id.to_string())
            .header("X-Tifda-Qos", message.qos.level().to_string())
            .body(message.body.clone())
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    TransportError::Timeout(self.timeout_ms)
                } else if err.is_connect() || err.is_request() {
                    TransportError::Transient(err.to_string())
                } else {
                    TransportError::Permanent(err.to_string())
                }
            })?;
        classify_status(response.status(), &message.recipient_id)
    }
}

/// In-memory transport with scripted failures and optional latency.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    script: Mutex<VecDeque<TransportError>>,
    delivered: Mutex<Vec<FormattedMessage>>,
    attempts: Mutex<u32>,
    latency: Option<Duration>,
}

impl MemoryTransport {
    /// Transport that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next attempts with `errors`, in order.
    #[must_use]
    pub fn failing_with(self, errors: impl IntoIterator<Item = TransportError>) -> Self {
        self.script.lock().extend(errors);
        self
    }

    /// Sleeps before answering each attempt.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Messages accepted so far.
    #[must_use]
    pub fn delivered(&self) -> Vec<FormattedMessage> {
        self.delivered.lock().clone()
    }

    /// Attempts seen so far, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        *self.attempts.lock()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: &FormattedMessage) -> Result<(), TransportError> {
        *self.attempts.lock() += 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = self.script.lock().pop_front() {
            return Err(err);
        }
        self.delivered.lock().push(message.clone());
        Ok(())
    }
}
