#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms
)]
#![warn(missing_docs)]

//! Structured JSON logging and the append-only audit trail shared by every
//! TIFDA component.

use std::{
    collections::VecDeque,
    fmt,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Log severity level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational events.
    Info,
    /// Warning indicator.
    Warn,
    /// Error indicator.
    Error,
}

/// Structured log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Module emitting the log.
    pub module: String,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Arbitrary JSON payload for metrics/fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record with the provided info.
    #[must_use]
    pub fn new(module: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            module: module.into(),
            level,
            message: message.into(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// Thread-safe JSON-lines writer with append-only semantics.
#[derive(Debug)]
pub struct JsonLogger {
    path: PathBuf,
    writer: Mutex<File>,
}

impl JsonLogger {
    /// Creates or opens a logger at the desired path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Writes a log record as JSON line.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        self.write_line(record)
    }

    /// Serializes any record as a single JSON line.
    pub fn write_line<T: Serialize>(&self, record: &T) -> Result<()> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Returns the underlying file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Component that produced an audit record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditComponent {
    /// Message-level input validation.
    Firewall,
    /// Entity-level re-validation of parsed entities.
    EntityGate,
    /// Fusion/merge engine.
    Fusion,
    /// Clearance filtering and downgrading.
    Classification,
    /// Per-recipient dissemination decisions.
    Dissemination,
    /// Human review queue.
    Review,
    /// Outbound delivery attempts.
    Transmission,
    /// Visualization mirror synchronization.
    Sync,
}

impl AuditComponent {
    /// Stable label used in logs.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Firewall => "firewall",
            Self::EntityGate => "entity_gate",
            Self::Fusion => "fusion",
            Self::Classification => "classification",
            Self::Dissemination => "dissemination",
            Self::Review => "review",
            Self::Transmission => "transmission",
            Self::Sync => "sync",
        }
    }
}

impl fmt::Display for AuditComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome recorded for an audited operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Input admitted.
    Accepted,
    /// Input refused.
    Rejected,
    /// Observation fused into an existing entity.
    Merged,
    /// Observation created a new entity.
    Created,
    /// Entity removed from the store.
    Removed,
    /// Entity or decision flagged for human review.
    Flagged,
    /// Data released to a recipient view.
    Released,
    /// Data withheld from a recipient.
    Withheld,
    /// Send blocked as a security event.
    Blocked,
    /// Delivery confirmed by the transport.
    Delivered,
    /// Delivery failed permanently or retries exhausted.
    Failed,
    /// Transient failure, retry scheduled.
    Retrying,
    /// Recipient or policy configuration was unusable.
    ConfigError,
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Record identifier.
    pub id: Uuid,
    /// When the decision was taken.
    pub timestamp: DateTime<Utc>,
    /// Component that decided.
    pub component: AuditComponent,
    /// Identifiers of the inputs involved (sensor, entity, recipient, message ids).
    pub input_ids: Vec<String>,
    /// Decision outcome.
    pub outcome: AuditOutcome,
    /// Short machine-readable reason (reason code or empty).
    pub reason: String,
    /// Free-form structured details.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl AuditRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(
        component: AuditComponent,
        input_ids: impl IntoIterator<Item = impl Into<String>>,
        outcome: AuditOutcome,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            component,
            input_ids: input_ids.into_iter().map(Into::into).collect(),
            outcome,
            reason: reason.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Attaches structured details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Append-only audit trail: bounded in-memory ring plus optional JSON-lines sink.
///
/// The ring only evicts from memory; the file sink keeps every record.
#[derive(Debug)]
pub struct AuditTrail {
    capacity: usize,
    recent: Mutex<VecDeque<AuditRecord>>,
    sink: Option<JsonLogger>,
}

impl AuditTrail {
    /// Creates an in-memory trail retaining the last `capacity` records.
    #[must_use]
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            recent: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            sink: None,
        }
    }

    /// Creates a trail that also appends every record to `path`.
    pub fn with_file(capacity: usize, path: impl AsRef<Path>) -> Result<Self> {
        let mut trail = Self::in_memory(capacity);
        trail.sink = Some(JsonLogger::new(path)?);
        Ok(trail)
    }

    /// Appends a record. Sink failures are reported but the in-memory copy is kept.
    pub fn record(&self, record: AuditRecord) -> Result<()> {
        let sink_result = self
            .sink
            .as_ref()
            .map_or(Ok(()), |sink| sink.write_line(&record));
        let mut recent = self.recent.lock();
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(record);
        sink_result
    }

    /// Snapshot of the retained records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.recent.lock().iter().cloned().collect()
    }

    /// Retained records for one component.
    #[must_use]
    pub fn by_component(&self, component: AuditComponent) -> Vec<AuditRecord> {
        self.recent
            .lock()
            .iter()
            .filter(|record| record.component == component)
            .cloned()
            .collect()
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.recent.lock().len()
    }

    /// Whether no record is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recent.lock().is_empty()
    }

    /// Path of the file sink, if configured.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.sink.as_ref().map(JsonLogger::path)
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::in_memory(4096)
    }
}
