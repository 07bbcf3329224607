#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms
)]
#![warn(missing_docs)]

//! Event bus abstractions: telemetry events and recipient channels share one
//! record shape carrying a topic and a delivery guarantee.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::broadcast};
use uuid::Uuid;

/// Broker delivery guarantee (MQTT-style levels).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum QualityOfService {
    /// Fire and forget.
    #[default]
    AtMostOnce,
    /// Retransmitted until acknowledged; duplicates possible.
    AtLeastOnce,
    /// Four-way handshake; no duplicates.
    ExactlyOnce,
}

impl QualityOfService {
    /// Numeric level as used on the wire.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

/// Generic event record encoded as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique identifier.
    pub id: String,
    /// Component producing the event.
    pub source: String,
    /// Event type (e.g., `cop.fusion.merged`).
    pub event_type: String,
    /// ISO timestamp.
    pub timestamp: String,
    /// Channel the record is published on; empty for plain telemetry.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,
    /// Requested delivery guarantee.
    #[serde(default)]
    pub qos: QualityOfService,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventRecord {
    /// Creates a telemetry event stamped now.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("evt-{}", Uuid::new_v4()),
            source: source.into(),
            event_type: event_type.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            topic: String::new(),
            qos: QualityOfService::AtMostOnce,
            payload,
        }
    }

    /// Routes the record to a channel with the given guarantee.
    #[must_use]
    pub fn on_topic(mut self, topic: impl Into<String>, qos: QualityOfService) -> Self {
        self.topic = topic.into();
        self.qos = qos;
        self
    }
}

/// Event publisher interface.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes an event to the bus.
    async fn publish(&self, event: EventRecord) -> Result<()>;
}

/// Event subscriber interface.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Returns a receiver that yields every event published after the call.
    async fn subscribe(&self) -> Result<broadcast::Receiver<EventRecord>>;
}

/// In-memory broadcast bus (for local development and tests).
#[derive(Debug, Clone)]
pub struct MemoryEventBus {
    sender: broadcast::Sender<EventRecord>,
    backlog: Arc<Mutex<VecDeque<EventRecord>>>,
    capacity: usize,
}

impl MemoryEventBus {
    /// Creates a new bus with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Snapshot of recent events retained in memory.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.backlog.lock().iter().cloned().collect()
    }

    /// Retained events published on `topic`.
    #[must_use]
    pub fn on_topic(&self, topic: &str) -> Vec<EventRecord> {
        self.backlog
            .lock()
            .iter()
            .filter(|event| event.topic == topic)
            .cloned()
            .collect()
    }
}

/// File-backed publisher useful for durable event logs.
#[derive(Debug, Clone)]
pub struct FileEventPublisher {
    path: PathBuf,
}

impl FileEventPublisher {
    /// Creates a publisher that appends JSON lines to the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }
}

#[async_trait]
impl EventPublisher for MemoryEventBus {
    async fn publish(&self, event: EventRecord) -> Result<()> {
        {
            let mut backlog = self.backlog.lock();
            if backlog.len() == self.capacity {
                backlog.pop_front();
            }
            backlog.push_back(event.clone());
        }
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for MemoryEventBus {
    async fn subscribe(&self) -> Result<broadcast::Receiver<EventRecord>> {
        Ok(self.sender.subscribe())
    }
}

#[async_trait]
impl EventPublisher for FileEventPublisher {
    async fn publish(&self, event: EventRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let data = serde_json::to_vec(&event)?;
        file.write_all(&data).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_event() -> EventRecord {
        EventRecord {
            id: "event-1".into(),
            source: "tester".into(),
            event_type: "unit.test".into(),
            timestamp: "2025-11-20T00:00:00Z".into(),
            topic: String::new(),
            qos: QualityOfService::AtMostOnce,
            payload: serde_json::json!({"value": 1}),
        }
    }

    #[tokio::test]
    async fn publishes_and_receives() {
        let bus = MemoryEventBus::new(16);
        let mut rx = bus.subscribe().await.unwrap();
        bus.publish(sample_event()).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "unit.test");
    }

    #[tokio::test]
    async fn backlog_is_bounded_and_topic_filtered() {
        let bus = MemoryEventBus::new(2);
        bus.publish(sample_event()).await.unwrap();
        bus.publish(
            sample_event().on_topic("tifda/output/base_alpha", QualityOfService::ExactlyOnce),
        )
        .await
        .unwrap();
        bus.publish(sample_event()).await.unwrap();
        assert_eq!(bus.snapshot().len(), 2);
        let routed = bus.on_topic("tifda/output/base_alpha");
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].qos.level(), 2);
    }

    #[tokio::test]
    async fn file_publisher_writes_events() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.log");
        let publisher = FileEventPublisher::new(&path).unwrap();
        publisher.publish(sample_event()).await.unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("unit.test"));
    }
}
