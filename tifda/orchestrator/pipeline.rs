use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use shared_event_bus::{EventPublisher, FileEventPublisher, MemoryEventBus};
use shared_logging::{AuditComponent, AuditOutcome, AuditRecord, AuditTrail, LogLevel};
use tifda_cop::{
    firewall::FirewallStats,
    model::{CopSnapshot, SensorMessage},
    sync::{HttpMirror, MirrorSync},
    telemetry::Telemetry,
    IngestPipeline, IngestReport, Rejection,
};
use tifda_dissemination::{
    recipient::resolve_all, BrokerTransport, DeliveryCounters, DisseminationDecision,
    DisseminationEngine, Dispatcher, FormatAdapter, HttpTransport, PolicyError, RecipientConfig,
    RecipientSpec, ReleaseGuard, ReviewQueue, ReviewSubject, RuleThreatEvaluator, ThreatAssessor,
    Transport, TransportKind, Verdict,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::TifdaConfig;

/// What happened to one decision on its way out.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// Handed to the recipient queue.
    Dispatched {
        /// Delivery tracking id.
        message_id: Uuid,
    },
    /// Waiting for a reviewer.
    Parked {
        /// Review item id.
        review_id: Uuid,
    },
    /// Stopped by the release guard.
    Blocked {
        /// Violation text.
        reason: String,
    },
    /// Could not be formatted or queued.
    Failed {
        /// Error text.
        reason: String,
    },
}

/// One decision and its fate.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    /// Decision id.
    pub decision_id: Uuid,
    /// Target recipient.
    pub recipient_id: String,
    /// Entities in the payload, decoys included.
    pub entity_count: usize,
    /// Adversarial channel traffic.
    pub is_deception: bool,
    /// Release result.
    pub outcome: ReleaseOutcome,
}

/// Summary of one assessment and dissemination cycle.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CycleReport {
    /// Snapshot the cycle worked on.
    pub snapshot_version: u64,
    /// Entities in that snapshot.
    pub entities: usize,
    /// Threat assessments approved this cycle.
    pub threats_approved: usize,
    /// Threat assessments waiting for review.
    pub threats_queued: usize,
    /// Entities whose evaluation failed or timed out.
    pub threats_failed: Vec<String>,
    /// Decisions made this cycle, plus reviewer-released ones.
    pub decisions: Vec<DecisionOutcome>,
    /// Recipient and assessment problems, one line each.
    pub policy_errors: Vec<String>,
    /// Neither the snapshot nor the approved threats moved since the last
    /// cycle, so nothing was reassessed or decided.
    pub unchanged: bool,
}

/// What the previous cycles already worked on.
#[derive(Debug, Default)]
struct CycleMarks {
    assessed: Option<u64>,
    decided: Option<(u64, Vec<String>)>,
    handled: HashMap<String, (u64, Vec<String>)>,
}

/// The assembled runtime: ingestion, threat assessment, review, decision,
/// release checks, formatting, and delivery.
pub struct Tifda {
    ingest: IngestPipeline,
    assessor: ThreatAssessor,
    review: ReviewQueue,
    engine: DisseminationEngine,
    guard: ReleaseGuard,
    dispatcher: Dispatcher,
    specs: Vec<RecipientSpec>,
    recipients: IndexMap<String, RecipientConfig>,
    config_errors: Vec<PolicyError>,
    bus: Arc<MemoryEventBus>,
    telemetry: Telemetry,
    marks: Mutex<CycleMarks>,
}

impl std::fmt::Debug for Tifda {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tifda")
            .field("recipients", &self.recipients.keys().collect::<Vec<_>>())
            .field("entities", &self.ingest.engine().len())
            .finish_non_exhaustive()
    }
}

/// Telemetry for `module` writing to the configured sinks, sharing `audit`.
pub fn telemetry_for(
    config: &TifdaConfig,
    module: &str,
    audit: &Arc<AuditTrail>,
    bus: Arc<MemoryEventBus>,
) -> Result<Telemetry> {
    let publisher: Arc<dyn EventPublisher> = match &config.telemetry.event_log {
        Some(path) => Arc::new(
            FileEventPublisher::new(path)
                .with_context(|| format!("opening event log {}", path.display()))?,
        ),
        None => bus,
    };
    let mut builder = Telemetry::builder(module)
        .event_publisher(publisher)
        .audit_trail(Arc::clone(audit));
    if let Some(path) = &config.telemetry.log_path {
        builder = builder.log_path(path);
    }
    builder.build()
}

impl Tifda {
    /// Builds every stage from configuration.
    ///
    /// Spawns one delivery worker per usable recipient, so it must run inside
    /// a Tokio runtime.
    pub fn from_config(config: &TifdaConfig) -> Result<Self> {
        let audit = Arc::new(match &config.telemetry.audit_path {
            Some(path) => AuditTrail::with_file(config.telemetry.audit_capacity, path)
                .with_context(|| format!("opening audit trail {}", path.display()))?,
            None => AuditTrail::in_memory(config.telemetry.audit_capacity),
        });
        let bus = Arc::new(MemoryEventBus::new(1024));
        let cop_telemetry = telemetry_for(config, "cop", &audit, bus.clone())?;
        let telemetry = telemetry_for(config, "dissemination", &audit, bus.clone())?;

        let ingest = IngestPipeline::from_config(
            config.firewall.clone(),
            config.sensor_directory(),
            config.fusion.clone(),
            cop_telemetry,
        )
        .context("compiling firewall patterns")?;

        let review = ReviewQueue::new(telemetry.clone());
        let assessor = ThreatAssessor::new(
            Arc::new(RuleThreatEvaluator::new(config.dissemination.affected_radius_km)),
            review.clone(),
            &config.dissemination,
            telemetry.clone(),
        );
        let engine = DisseminationEngine::new(config.dissemination.clone(), telemetry.clone());
        let dispatcher = Dispatcher::new(&config.delivery, telemetry.clone());

        let (decoded, mut config_errors) = config.recipient_specs();
        let (resolved, errors) = resolve_all(&decoded);
        config_errors.extend(errors);
        let mut recipients = IndexMap::new();
        for recipient in resolved {
            let transport: Arc<dyn Transport> = match (recipient.transport.kind, &recipient.transport.endpoint) {
                (TransportKind::Http, Some(endpoint)) => Arc::new(
                    HttpTransport::new(endpoint.as_str(), Duration::from_millis(config.delivery.timeout_ms))
                        .with_context(|| format!("building HTTP transport for {}", recipient.recipient_id))?,
                ),
                _ => Arc::new(BrokerTransport::new(bus.clone())),
            };
            dispatcher.register(recipient.recipient_id.clone(), transport);
            recipients.insert(recipient.recipient_id.clone(), recipient);
        }
        let mut seen = HashSet::new();
        let specs = decoded
            .into_iter()
            .filter(|spec| {
                let id = spec.recipient_id.trim();
                recipients.contains_key(id) && seen.insert(id.to_string())
            })
            .collect();
        for error in &config_errors {
            let _ = telemetry.log(
                LogLevel::Error,
                "dissemination.recipient.skipped",
                json!({ "error": error.to_string() }),
            );
            let _ = telemetry.audit(AuditRecord::new(
                AuditComponent::Dissemination,
                [error.to_string()],
                AuditOutcome::ConfigError,
                "recipient disabled",
            ));
        }

        Ok(Self {
            ingest,
            assessor,
            review,
            guard: ReleaseGuard::new(telemetry.clone()),
            engine,
            dispatcher,
            specs,
            recipients,
            config_errors,
            bus,
            telemetry,
            marks: Mutex::new(CycleMarks::default()),
        })
    }

    /// Starts the visualization follower when an endpoint is configured.
    pub fn spawn_sync(&self, config: &TifdaConfig) -> Result<Option<JoinHandle<()>>> {
        let Some(mirror) = HttpMirror::from_config(&config.sync).context("building mirror client")? else {
            return Ok(None);
        };
        let follower = Arc::new(MirrorSync::new(
            Arc::clone(self.ingest.engine()),
            Arc::new(mirror),
            config.sync.clone(),
            self.telemetry.clone(),
        ));
        Ok(Some(follower.spawn()))
    }

    /// Runs one raw sensor message through the firewall and fusion.
    pub fn ingest(&self, raw: &Value, now: DateTime<Utc>) -> IngestReport {
        self.ingest.ingest_raw(raw, now)
    }

    /// Firewall verdict only; nothing is fused.
    pub fn validate(&self, raw: &Value, now: DateTime<Utc>) -> Result<SensorMessage, Rejection> {
        self.ingest.gate().validate_raw(raw, now)
    }

    /// Firewall decision counters.
    #[must_use]
    pub fn firewall_stats(&self) -> FirewallStats {
        self.ingest.gate().stats()
    }

    /// Current picture.
    #[must_use]
    pub fn snapshot(&self) -> Arc<CopSnapshot> {
        self.ingest.engine().snapshot()
    }

    /// Human review queue.
    #[must_use]
    pub const fn review(&self) -> &ReviewQueue {
        &self.review
    }

    /// Delivery dispatcher and its ledger.
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// In-process bus carrying broker deliveries and, unless an event log is
    /// configured, telemetry events.
    #[must_use]
    pub const fn bus(&self) -> &Arc<MemoryEventBus> {
        &self.bus
    }

    /// Recipients disabled at startup.
    #[must_use]
    pub fn config_errors(&self) -> &[PolicyError] {
        &self.config_errors
    }

    /// Assesses threats on the latest snapshot, decides per recipient, and
    /// releases or parks each decision. Decisions released by reviewers since
    /// the last cycle go out too.
    ///
    /// A snapshot version is assessed once. Decisions are remade only when the
    /// snapshot or the set of approved threats changed, and a recipient never
    /// gets the same subset of the same snapshot twice.
    pub async fn cycle(&self) -> CycleReport {
        let snapshot = self.snapshot();
        let mut report = CycleReport {
            snapshot_version: snapshot.version,
            entities: snapshot.len(),
            ..CycleReport::default()
        };
        let fresh = self.marks.lock().assessed != Some(snapshot.version);
        if fresh {
            let threats = self.assessor.assess(&snapshot).await;
            report.threats_approved = threats.approved.len();
            report.threats_queued = threats.queued.len();
            report.threats_failed = threats.failed;
            self.marks.lock().assessed = Some(snapshot.version);
        }

        let approved = self.review.approved_threats();
        let mut approved_ids: Vec<String> = approved.iter().map(|t| t.assessment_id.clone()).collect();
        approved_ids.sort();
        let mark = (snapshot.version, approved_ids);
        let seen = self.marks.lock().decided.as_ref() == Some(&mark);
        if seen {
            report.unchanged = true;
            report.decisions.extend(self.release_approved().await);
            return report;
        }
        let round = self.engine.decide(&snapshot, &approved, &self.specs);
        report.policy_errors = round.errors.iter().map(ToString::to_string).collect();
        self.marks.lock().decided = Some(mark);

        for decision in round.decisions {
            if !self.first_time(&decision) {
                continue;
            }
            let outcome = if decision.requires_human_approval {
                let reasons = decision.approval_reasons.clone();
                let summary = summarize(&decision, ReleaseOutcome::Parked { review_id: Uuid::nil() });
                let review_id = self.review.submit(ReviewSubject::Dissemination(decision), reasons);
                DecisionOutcome {
                    outcome: ReleaseOutcome::Parked { review_id },
                    ..summary
                }
            } else {
                self.release(decision).await
            };
            report.decisions.push(outcome);
        }
        report.decisions.extend(self.release_approved().await);
        let _ = self.telemetry.event(
            "tifda.cycle.completed",
            json!({
                "snapshot_version": report.snapshot_version,
                "decisions": report.decisions.len(),
                "policy_errors": report.policy_errors.len(),
            }),
        );
        report
    }

    /// Records `decision` as handled; false if its recipient already got the
    /// same subset of the same snapshot.
    fn first_time(&self, decision: &DisseminationDecision) -> bool {
        let mut subset = decision.information_subset.clone();
        subset.sort();
        let key = (decision.snapshot_version, subset);
        let mut marks = self.marks.lock();
        if marks.handled.get(&decision.recipient_id) == Some(&key) {
            return false;
        }
        marks.handled.insert(decision.recipient_id.clone(), key);
        true
    }

    /// Sends every decision a reviewer approved since the last call.
    pub async fn release_approved(&self) -> Vec<DecisionOutcome> {
        let mut outcomes = Vec::new();
        for decision in self.review.take_released() {
            outcomes.push(self.release(decision).await);
        }
        outcomes
    }

    /// Approves every pending review item as `reviewer`, then releases.
    pub async fn approve_all(&self, reviewer: &str) -> Vec<DecisionOutcome> {
        for item in self.review.pending() {
            let _ = self.review.decide(item.id, Verdict::Approve, reviewer);
        }
        self.release_approved().await
    }

    async fn release(&self, decision: DisseminationDecision) -> DecisionOutcome {
        let Some(recipient) = self.recipients.get(&decision.recipient_id) else {
            let reason = format!("recipient '{}' is not configured", decision.recipient_id);
            return summarize(&decision, ReleaseOutcome::Failed { reason });
        };
        if let Err(violation) = self.guard.check(&decision, recipient) {
            return summarize(&decision, ReleaseOutcome::Blocked { reason: violation.to_string() });
        }
        let message = match FormatAdapter::render(&decision, recipient.format) {
            Ok(message) => message,
            Err(err) => {
                return summarize(&decision, ReleaseOutcome::Failed { reason: err.to_string() });
            }
        };
        let outcome = match self.dispatcher.dispatch(message).await {
            Ok(message_id) => ReleaseOutcome::Dispatched { message_id },
            Err(err) => ReleaseOutcome::Failed { reason: err.to_string() },
        };
        summarize(&decision, outcome)
    }

    /// Drains delivery queues and returns per-recipient counters.
    pub async fn shutdown(&self) -> IndexMap<String, DeliveryCounters> {
        self.dispatcher.shutdown().await;
        self.dispatcher
            .tracker()
            .totals(Utc::now())
            .into_iter()
            .collect()
    }
}

fn summarize(decision: &DisseminationDecision, outcome: ReleaseOutcome) -> DecisionOutcome {
    DecisionOutcome {
        decision_id: decision.decision_id,
        recipient_id: decision.recipient_id.clone(),
        entity_count: decision.entities.len(),
        is_deception: decision.is_deception,
        outcome,
    }
}
