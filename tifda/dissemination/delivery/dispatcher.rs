use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::{AuditComponent, AuditOutcome, AuditRecord, LogLevel};
use tifda_cop::{telemetry::Telemetry, RetryPolicy};
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

use super::{
    tracker::DeliveryTracker,
    transport::{Transport, TransportError},
};
use crate::format::FormattedMessage;

/// Retry, timeout, and accounting settings for outbound delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Attempts per message, first one included.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub base_delay_ms: u64,
    /// Backoff cap.
    pub max_delay_ms: u64,
    /// Deadline of a single attempt.
    pub timeout_ms: u64,
    /// Window for sent/failed counters.
    pub window_secs: u64,
    /// How long finished delivery records stay queryable.
    pub retention_secs: u64,
    /// Messages buffered per recipient before `dispatch` waits.
    pub queue_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            max_attempts: retry.max_attempts,
            base_delay_ms: retry.base_delay_ms,
            max_delay_ms: retry.max_delay_ms,
            timeout_ms: 3_000,
            window_secs: 60,
            retention_secs: 600,
            queue_capacity: 256,
        }
    }
}

impl DeliveryConfig {
    /// Backoff policy for the retry loop.
    #[must_use]
    pub const fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }
}

#[derive(Debug)]
struct Worker {
    sender: mpsc::Sender<FormattedMessage>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone)]
struct Delivery {
    retry: RetryPolicy,
    timeout: Duration,
    tracker: DeliveryTracker,
    telemetry: Telemetry,
}

/// Fans formatted messages out to per-recipient queues.
///
/// Each registered recipient gets its own worker task, so a slow or failing
/// recipient only delays its own messages. Attempts carry a deadline; timeouts
/// and transient errors back off exponentially up to `max_attempts`, anything
/// else fails the message at once.
#[derive(Debug)]
pub struct Dispatcher {
    delivery: Delivery,
    queue_capacity: usize,
    workers: Mutex<HashMap<String, Worker>>,
}

impl Dispatcher {
    /// Creates a dispatcher with no recipients.
    #[must_use]
    pub fn new(config: &DeliveryConfig, telemetry: Telemetry) -> Self {
        Self {
            delivery: Delivery {
                retry: config.retry(),
                timeout: Duration::from_millis(config.timeout_ms),
                tracker: DeliveryTracker::new(
                    Duration::from_secs(config.window_secs),
                    Duration::from_secs(config.retention_secs),
                ),
                telemetry,
            },
            queue_capacity: config.queue_capacity.max(1),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Delivery ledger.
    #[must_use]
    pub const fn tracker(&self) -> &DeliveryTracker {
        &self.delivery.tracker
    }

    /// Starts a worker for `recipient_id`; a previous worker drains and stops.
    pub fn register(&self, recipient_id: impl Into<String>, transport: Arc<dyn Transport>) {
        let recipient_id = recipient_id.into();
        let (sender, mut receiver) = mpsc::channel::<FormattedMessage>(self.queue_capacity);
        let delivery = self.delivery.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                delivery.deliver(transport.as_ref(), message).await;
            }
        });
        self.workers
            .lock()
            .insert(recipient_id, Worker { sender, handle });
    }

    /// Recipients with a running worker.
    #[must_use]
    pub fn recipients(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Queues `message` for its recipient and returns its tracking id.
    ///
    /// A recipient without a worker is a permanent failure, reported at once.
    pub async fn dispatch(&self, message: FormattedMessage) -> Result<Uuid, TransportError> {
        let id = message.message_id;
        self.delivery.tracker.track(&message);
        let sender = self
            .workers
            .lock()
            .get(&message.recipient_id)
            .map(|worker| worker.sender.clone());
        let Some(sender) = sender else {
            let err = TransportError::UnknownRecipient(message.recipient_id.clone());
            self.delivery.give_up(&message, 0, &err);
            return Err(err);
        };
        if let Err(mpsc::error::SendError(message)) = sender.send(message).await {
            let err = TransportError::Permanent("delivery worker stopped".into());
            self.delivery.give_up(&message, 0, &err);
            return Err(err);
        }
        Ok(id)
    }

    /// Closes every queue and waits until queued messages are finished.
    pub async fn shutdown(&self) {
        let workers: Vec<Worker> = self.workers.lock().drain().map(|(_, worker)| worker).collect();
        for Worker { sender, handle } in workers {
            drop(sender);
            if let Err(err) = handle.await {
                let _ = self.delivery.telemetry.log(
                    LogLevel::Error,
                    "delivery.worker.crashed",
                    json!({ "error": err.to_string() }),
                );
            }
        }
    }
}

impl Delivery {
    async fn deliver(&self, transport: &dyn Transport, message: FormattedMessage) {
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let outcome = tokio::time::timeout(self.timeout, transport.send(&message))
                .await
                .unwrap_or_else(|_| {
                    Err(TransportError::Timeout(
                        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    ))
                });
            match outcome {
                Ok(()) => {
                    self.tracker.delivered(message.message_id, attempt);
                    let _ = self.telemetry.audit(AuditRecord::new(
                        AuditComponent::Transmission,
                        [message.message_id.to_string()],
                        AuditOutcome::Delivered,
                        format!("delivered to {} after {attempt} attempt(s)", message.recipient_id),
                    ));
                    let _ = self.telemetry.log(
                        LogLevel::Info,
                        "delivery.delivered",
                        json!({
                            "message_id": message.message_id,
                            "recipient_id": message.recipient_id,
                            "attempts": attempt,
                        }),
                    );
                    return;
                }
                Err(err) if err.is_transient() && self.retry.allows_retry(attempt) => {
                    let delay = self.retry.delay_after(attempt);
                    let next = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    self.tracker.retrying(message.message_id, attempt, &err, next);
                    let details = json!({
                        "message_id": message.message_id,
                        "recipient_id": message.recipient_id,
                        "attempt": attempt,
                        "error": err.to_string(),
                        "retry_in_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    });
                    let _ = self.telemetry.log(LogLevel::Warn, "delivery.attempt.failed", details.clone());
                    let _ = self.telemetry.event("delivery.attempt.failed", details.clone());
                    let _ = self.telemetry.audit(
                        AuditRecord::new(
                            AuditComponent::Transmission,
                            [message.message_id.to_string()],
                            AuditOutcome::Retrying,
                            err.to_string(),
                        )
                        .with_details(details),
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.give_up(&message, attempt, &err);
                    return;
                }
            }
        }
    }

    fn give_up(&self, message: &FormattedMessage, attempts: u32, err: &TransportError) {
        self.tracker.failed(message.message_id, attempts, err);
        let details = json!({
            "message_id": message.message_id,
            "decision_id": message.decision_id,
            "recipient_id": message.recipient_id,
            "attempts": attempts,
            "error": err.to_string(),
        });
        let _ = self.telemetry.log(LogLevel::Error, "delivery.failed", details.clone());
        let _ = self.telemetry.event("delivery.failed", details.clone());
        let _ = self.telemetry.audit(
            AuditRecord::new(
                AuditComponent::Transmission,
                [message.message_id.to_string()],
                AuditOutcome::Failed,
                err.to_string(),
            )
            .with_details(details),
        );
    }
}
