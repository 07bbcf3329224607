use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{AuditRecord, AuditTrail, JsonLogger, LogLevel, LogRecord};
use tokio::runtime::Handle;

/// Builder configuring telemetry for a TIFDA component.
pub struct TelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
    audit: Option<Arc<AuditTrail>>,
}

impl TelemetryBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            event_publisher: None,
            audit: None,
        }
    }

    /// Sets the JSON log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Assigns the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Shares an audit trail with other components.
    #[must_use]
    pub fn audit_trail(mut self, audit: Arc<AuditTrail>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Finalizes the builder.
    pub fn build(self) -> Result<Telemetry> {
        let logger = self.log_path.map(JsonLogger::new).transpose()?;
        Ok(Telemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.event_publisher,
                audit: self.audit.unwrap_or_default(),
            }),
        })
    }
}

/// Telemetry handle: structured log lines, bus events, and audit records.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("module", &self.inner.module)
            .finish_non_exhaustive()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    publisher: Option<Arc<dyn EventPublisher>>,
    audit: Arc<AuditTrail>,
}

impl Telemetry {
    /// Returns a builder for this telemetry helper.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> TelemetryBuilder {
        TelemetryBuilder::new(module)
    }

    /// Telemetry that only keeps an in-memory audit trail.
    #[must_use]
    pub fn in_memory(module: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: module.into(),
                logger: None,
                publisher: None,
                audit: Arc::new(AuditTrail::default()),
            }),
        }
    }

    /// Module name stamped on every record.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Shared audit trail.
    #[must_use]
    pub fn audit_trail(&self) -> &Arc<AuditTrail> {
        &self.inner.audit
    }

    /// Logs a structured record.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let mut record = LogRecord::new(&self.inner.module, level, message);
            if let Value::Object(map) = metadata {
                record.metadata = map;
            }
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Emits an event entry via the configured bus.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        let Some(publisher) = &self.inner.publisher else {
            return Ok(());
        };
        let record = EventRecord::new(&self.inner.module, event_type, payload);
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    eprintln!("telemetry event publish failed: {err:?}");
                }
            });
            Ok(())
        } else {
            futures::executor::block_on(publisher.publish(record))
        }
    }

    /// Appends an audit record.
    pub fn audit(&self, record: AuditRecord) -> Result<()> {
        self.inner.audit.record(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use shared_logging::{AuditComponent, AuditOutcome};
    use tempfile::tempdir;

    #[test]
    fn telemetry_logs_emits_and_audits() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("cop.log");
        let bus = Arc::new(MemoryEventBus::new(8));
        let telemetry = Telemetry::builder("cop")
            .log_path(&log_path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "cop.test", json!({ "sensor": "radar_01" }))
            .unwrap();
        telemetry.event("cop.test", json!({ "entities": 1 })).unwrap();
        telemetry
            .audit(AuditRecord::new(
                AuditComponent::Fusion,
                ["track-1"],
                AuditOutcome::Created,
                "",
            ))
            .unwrap();
        let content = std::fs::read_to_string(log_path).unwrap();
        assert!(content.contains("cop.test"));
        assert_eq!(bus.snapshot().len(), 1);
        assert_eq!(telemetry.audit_trail().len(), 1);
    }
}
