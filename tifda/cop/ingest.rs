use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use shared_logging::LogLevel;

use crate::{
    config::{FirewallConfig, FusionConfig, SensorDirectory},
    firewall::{EntityGate, MessageGate, Rejection, RejectionReason},
    fusion::{FusionEngine, FusionError, IngestHandle, MergeOutcome, Observation},
    model::SensorMessage,
    parsers::ParserRegistry,
    telemetry::Telemetry,
};

/// An entity dropped by the entity gate.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DroppedEntity {
    /// Entity id as reported (or `?`).
    pub entity_id: String,
    /// Mapped reason code.
    pub reason: RejectionReason,
    /// Human-readable detail.
    pub detail: String,
}

/// Result of pushing one sensor message through the front door.
#[derive(Debug, Clone, Serialize, Default)]
pub struct IngestReport {
    /// Sensor that sent the message.
    pub sensor_id: String,
    /// Message-level refusal, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    /// Parser failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
    /// Entities refused individually.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dropped: Vec<DroppedEntity>,
    /// Fusion outcome for every admitted entity.
    pub outcomes: Vec<MergeOutcome>,
}

impl IngestReport {
    /// Whether the message passed the message gate and parsed.
    #[must_use]
    pub const fn accepted(&self) -> bool {
        self.rejection.is_none() && self.parse_error.is_none()
    }
}

/// Firewall, parser registry, entity gate, and fusion wired in order.
#[derive(Debug)]
pub struct IngestPipeline {
    gate: MessageGate,
    entity_gate: EntityGate,
    parsers: ParserRegistry,
    engine: Arc<FusionEngine>,
    telemetry: Telemetry,
}

impl IngestPipeline {
    /// Assembles a pipeline from its parts.
    #[must_use]
    pub const fn new(
        gate: MessageGate,
        entity_gate: EntityGate,
        parsers: ParserRegistry,
        engine: Arc<FusionEngine>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            gate,
            entity_gate,
            parsers,
            engine,
            telemetry,
        }
    }

    /// Builds every stage from configuration with the default parsers.
    pub fn from_config(
        firewall: FirewallConfig,
        sensors: SensorDirectory,
        fusion: FusionConfig,
        telemetry: Telemetry,
    ) -> Result<Self, regex::Error> {
        let gate = MessageGate::new(firewall.clone(), sensors, telemetry.clone())?;
        let entity_gate = EntityGate::new(firewall, telemetry.clone())?;
        let engine = Arc::new(FusionEngine::new(fusion, telemetry.clone()));
        Ok(Self::new(
            gate,
            entity_gate,
            ParserRegistry::with_defaults(),
            engine,
            telemetry,
        ))
    }

    /// Fusion engine owning the store.
    #[must_use]
    pub const fn engine(&self) -> &Arc<FusionEngine> {
        &self.engine
    }

    /// Message gate (for stats).
    #[must_use]
    pub const fn gate(&self) -> &MessageGate {
        &self.gate
    }

    /// Parser registry, open for extra decoders.
    pub fn parsers_mut(&mut self) -> &mut ParserRegistry {
        &mut self.parsers
    }

    /// Validates a raw JSON message and fuses what survives.
    pub fn ingest_raw(&self, raw: &Value, now: DateTime<Utc>) -> IngestReport {
        match self.gate.validate_raw(raw, now) {
            Ok(message) => {
                let (mut report, observations) = self.prepare(&message, now);
                report.outcomes = self.engine.ingest_batch(observations);
                report
            }
            Err(rejection) => rejected(raw, rejection),
        }
    }

    /// Validates a typed message and fuses what survives.
    pub fn ingest(&self, message: &SensorMessage, now: DateTime<Utc>) -> IngestReport {
        if let Err(rejection) = self.gate.validate(message, now) {
            return IngestReport {
                sensor_id: message.sensor_id.clone(),
                rejection: Some(rejection),
                ..IngestReport::default()
            };
        }
        let (mut report, observations) = self.prepare(message, now);
        report.outcomes = self.engine.ingest_batch(observations);
        report
    }

    /// Like [`Self::ingest`] but hands observations to the ordered ingest queue.
    pub async fn ingest_queued(
        &self,
        handle: &IngestHandle,
        message: &SensorMessage,
        now: DateTime<Utc>,
    ) -> Result<IngestReport, FusionError> {
        if let Err(rejection) = self.gate.validate(message, now) {
            return Ok(IngestReport {
                sensor_id: message.sensor_id.clone(),
                rejection: Some(rejection),
                ..IngestReport::default()
            });
        }
        let (mut report, observations) = self.prepare(message, now);
        if !observations.is_empty() {
            report.outcomes = handle.submit(observations).await?;
        }
        Ok(report)
    }

    fn prepare(&self, message: &SensorMessage, now: DateTime<Utc>) -> (IngestReport, Vec<Observation>) {
        let mut report = IngestReport {
            sensor_id: message.sensor_id.clone(),
            ..IngestReport::default()
        };
        let drafts = match self.parsers.parse(message) {
            Ok(drafts) => drafts,
            Err(err) => {
                let _ = self.telemetry.log(
                    LogLevel::Warn,
                    "cop.parser.failed",
                    json!({ "sensor_id": message.sensor_id, "error": err.to_string() }),
                );
                report.parse_error = Some(err.to_string());
                return (report, Vec::new());
            }
        };
        let sensor_default = self
            .gate
            .sensors()
            .get(&message.sensor_id)
            .map_or_else(
                || message.sensor_type.default_classification(),
                crate::config::SensorRegistration::classification,
            );
        let mut observations = Vec::with_capacity(drafts.len());
        for draft in &drafts {
            match self.entity_gate.admit_value(draft, &message.sensor_id, now) {
                Ok(entity) => {
                    let level = Observation::resolve_classification(
                        message.classification_override,
                        sensor_default,
                        entity.information_classification,
                    );
                    observations.push(Observation::from_entity(
                        &entity,
                        message.sensor_id.clone(),
                        message.sensor_type,
                        level,
                    ));
                }
                Err(err) => report.dropped.push(DroppedEntity {
                    entity_id: draft
                        .get("entity_id")
                        .and_then(Value::as_str)
                        .unwrap_or("?")
                        .to_string(),
                    reason: err.reason(),
                    detail: err.to_string(),
                }),
            }
        }
        (report, observations)
    }
}

fn rejected(raw: &Value, rejection: Rejection) -> IngestReport {
    IngestReport {
        sensor_id: raw
            .get("sensor_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        rejection: Some(rejection),
        ..IngestReport::default()
    }
}
