use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use shared_logging::{AuditComponent, AuditOutcome, AuditRecord, LogLevel};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use super::{
    correlation::{best_match, correlate},
    merge::{create, merge_with_effect},
    observation::Observation,
};
use crate::{
    config::FusionConfig,
    model::{CopSnapshot, EntityCop},
    telemetry::Telemetry,
};

/// What happened to an observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// No entity correlated; a new one was created.
    Created {
        /// New entity id.
        entity_id: String,
    },
    /// Fused into an existing entity.
    Merged {
        /// Target entity id.
        entity_id: String,
        /// Sensors now disagree and the entity awaits review.
        flagged: bool,
    },
    /// The observation was already reflected; nothing changed.
    Unchanged {
        /// Target entity id.
        entity_id: String,
    },
}

impl MergeOutcome {
    /// Entity the observation landed in.
    #[must_use]
    pub fn entity_id(&self) -> &str {
        match self {
            Self::Created { entity_id }
            | Self::Merged { entity_id, .. }
            | Self::Unchanged { entity_id } => entity_id,
        }
    }
}

/// Why an entity left the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", content = "detail", rename_all = "snake_case")]
pub enum RemovalCause {
    /// Operator or upstream removal event.
    Explicit(String),
    /// No report within the maximum age.
    Stale,
    /// Deleted in the visualization mirror.
    ExternalSync,
}

impl RemovalCause {
    fn label(&self) -> &str {
        match self {
            Self::Explicit(reason) => reason,
            Self::Stale => "stale",
            Self::ExternalSync => "external_sync",
        }
    }
}

/// Errors surfaced by the ingest queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FusionError {
    /// The ingest worker has shut down.
    #[error("fusion ingest worker stopped")]
    WorkerStopped,
}

#[derive(Debug, Default)]
struct StoreState {
    entities: BTreeMap<String, EntityCop>,
    aliases: HashMap<String, String>,
    version: u64,
}

/// Owner of the canonical entity store.
///
/// Writers are serialized by the store lock; readers take the latest published
/// [`CopSnapshot`], which is immutable and never observes a half-applied merge.
#[derive(Debug)]
pub struct FusionEngine {
    config: FusionConfig,
    state: RwLock<StoreState>,
    published: watch::Sender<Arc<CopSnapshot>>,
    telemetry: Telemetry,
}

impl FusionEngine {
    /// Creates an empty store.
    #[must_use]
    pub fn new(config: FusionConfig, telemetry: Telemetry) -> Self {
        let (published, _) = watch::channel(Arc::new(CopSnapshot::empty()));
        Self {
            config,
            state: RwLock::new(StoreState::default()),
            published,
            telemetry,
        }
    }

    /// Fusion tuning in use.
    #[must_use]
    pub const fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<CopSnapshot> {
        Arc::clone(&self.published.borrow())
    }

    /// Receiver notified on every committed change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<CopSnapshot>> {
        self.published.subscribe()
    }

    /// Current copy of one entity.
    #[must_use]
    pub fn get(&self, entity_id: &str) -> Option<EntityCop> {
        self.state.read().entities.get(entity_id).cloned()
    }

    /// Number of tracked entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entities.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().entities.is_empty()
    }

    /// Fuses one observation.
    pub fn ingest(&self, observation: Observation) -> MergeOutcome {
        let (outcome, record) = {
            let mut state = self.state.write();
            let applied = self.apply(&mut state, &observation);
            if !matches!(applied.0, MergeOutcome::Unchanged { .. }) {
                self.publish(&mut state);
            }
            applied
        };
        self.report(&outcome, record);
        outcome
    }

    /// Fuses several observations in order, publishing one snapshot at the end.
    pub fn ingest_batch(&self, observations: Vec<Observation>) -> Vec<MergeOutcome> {
        let applied: Vec<(MergeOutcome, AuditRecord)> = {
            let mut state = self.state.write();
            let applied: Vec<_> = observations
                .iter()
                .map(|observation| self.apply(&mut state, observation))
                .collect();
            if applied
                .iter()
                .any(|(outcome, _)| !matches!(outcome, MergeOutcome::Unchanged { .. }))
            {
                self.publish(&mut state);
            }
            applied
        };
        applied
            .into_iter()
            .map(|(outcome, record)| {
                self.report(&outcome, record);
                outcome
            })
            .collect()
    }

    fn report(&self, outcome: &MergeOutcome, record: AuditRecord) {
        let event = match outcome {
            MergeOutcome::Created { .. } => "cop.fusion.created",
            MergeOutcome::Merged { flagged: true, .. } => "cop.fusion.flagged",
            MergeOutcome::Merged { .. } => "cop.fusion.merged",
            MergeOutcome::Unchanged { .. } => "cop.fusion.unchanged",
        };
        if matches!(outcome, MergeOutcome::Merged { flagged: true, .. }) {
            let _ = self
                .telemetry
                .log(LogLevel::Warn, "cop.fusion.conflict", record.details.clone());
        }
        let _ = self.telemetry.event(event, json!(outcome));
        let _ = self.telemetry.audit(record);
    }

    fn apply(&self, state: &mut StoreState, observation: &Observation) -> (MergeOutcome, AuditRecord) {
        let alias = observation.alias();
        let correlates = |id: &String| {
            state
                .entities
                .get(id)
                .is_some_and(|entity| correlate(entity, observation, &self.config).is_some())
        };
        let target = state
            .aliases
            .get(&alias)
            .filter(|id| correlates(*id))
            .cloned()
            .or_else(|| Some(observation.report.track_id.clone()).filter(|id| correlates(id)))
            .or_else(|| {
                best_match(state.entities.values(), observation, &self.config)
                    .map(|entity| entity.entity_id.clone())
            });
        let inputs = [observation.sensor_id.clone(), observation.report.track_id.clone()];

        let Some(entity_id) = target else {
            let entity_id = unused_id(&state.entities, observation);
            let mut entity = create(observation, &self.config);
            entity.entity_id.clone_from(&entity_id);
            state.aliases.insert(alias, entity_id.clone());
            let record = AuditRecord::new(
                AuditComponent::Fusion,
                inputs,
                AuditOutcome::Created,
                "no correlating entity",
            )
            .with_details(json!({
                "entity_id": entity_id,
                "information_classification": entity.information_classification,
            }));
            state.entities.insert(entity_id.clone(), entity);
            return (MergeOutcome::Created { entity_id }, record);
        };

        state.aliases.insert(alias, entity_id.clone());
        let Some(existing) = state.entities.get(&entity_id) else {
            return (
                MergeOutcome::Unchanged {
                    entity_id: entity_id.clone(),
                },
                AuditRecord::new(AuditComponent::Fusion, inputs, AuditOutcome::Rejected, "target vanished"),
            );
        };
        let (merged, effect) = merge_with_effect(existing, observation, &self.config);
        if &merged == existing {
            let record = AuditRecord::new(AuditComponent::Fusion, inputs, AuditOutcome::Merged, "duplicate")
                .with_details(json!({ "entity_id": entity_id }));
            return (MergeOutcome::Unchanged { entity_id }, record);
        }
        let (outcome, reason) = if effect.conflict {
            (AuditOutcome::Flagged, "sensor reports diverge")
        } else {
            (AuditOutcome::Merged, "correlated")
        };
        let record = AuditRecord::new(AuditComponent::Fusion, inputs, outcome, reason).with_details(json!({
            "entity_id": entity_id,
            "confidence": merged.confidence,
            "source_sensors": merged.source_sensors,
            "information_classification": merged.information_classification,
        }));
        state.entities.insert(entity_id.clone(), merged);
        (
            MergeOutcome::Merged {
                entity_id,
                flagged: effect.conflict,
            },
            record,
        )
    }

    /// Removes an entity and forgets its track aliases.
    pub fn remove(&self, entity_id: &str, cause: RemovalCause) -> Option<EntityCop> {
        let removed = {
            let mut state = self.state.write();
            let removed = state.entities.remove(entity_id);
            if removed.is_some() {
                state.aliases.retain(|_, target| target != entity_id);
                self.publish(&mut state);
            }
            removed
        };
        if removed.is_some() {
            self.audit_removal(entity_id, &cause);
        }
        removed
    }

    /// Drops entities whose newest report is older than `max_age` at `now`.
    pub fn prune_stale(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<String> {
        let cutoff = now - max_age;
        let removed: Vec<String> = {
            let mut state = self.state.write();
            let stale: Vec<String> = state
                .entities
                .values()
                .filter(|entity| entity.timestamp < cutoff)
                .map(|entity| entity.entity_id.clone())
                .collect();
            for id in &stale {
                state.entities.remove(id);
            }
            if !stale.is_empty() {
                state
                    .aliases
                    .retain(|_, target| !stale.iter().any(|id| id == target));
                self.publish(&mut state);
            }
            stale
        };
        for id in &removed {
            self.audit_removal(id, &RemovalCause::Stale);
        }
        removed
    }

    /// Starts the single ordered consumer that feeds this engine.
    pub fn spawn_ingest_worker(self: &Arc<Self>, capacity: usize) -> (IngestHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<IngestCommand>(capacity.max(1));
        let engine = Arc::clone(self);
        let worker = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    IngestCommand::Observe(observations, reply) => {
                        let outcomes = engine.ingest_batch(observations);
                        let _ = reply.send(outcomes);
                    }
                    IngestCommand::Remove(entity_id, cause, reply) => {
                        let _ = reply.send(engine.remove(&entity_id, cause).is_some());
                    }
                }
            }
        });
        (IngestHandle { tx }, worker)
    }

    fn publish(&self, state: &mut StoreState) {
        state.version += 1;
        let snapshot = CopSnapshot {
            version: state.version,
            taken_at: Utc::now(),
            entities: state.entities.clone(),
        };
        self.published.send_replace(Arc::new(snapshot));
    }

    fn audit_removal(&self, entity_id: &str, cause: &RemovalCause) {
        let _ = self.telemetry.audit(
            AuditRecord::new(
                AuditComponent::Fusion,
                [entity_id.to_string()],
                AuditOutcome::Removed,
                cause.label(),
            )
            .with_details(json!({ "cause": cause })),
        );
        let _ = self
            .telemetry
            .event("cop.fusion.removed", json!({ "entity_id": entity_id, "cause": cause }));
    }
}

/// Id for a new entity: the reported track id, or a sensor-scoped variant when
/// another sensor already owns that id.
fn unused_id(entities: &BTreeMap<String, EntityCop>, observation: &Observation) -> String {
    let track_id = &observation.report.track_id;
    if !entities.contains_key(track_id) {
        return track_id.clone();
    }
    let scoped = format!("{}_{track_id}", observation.sensor_id);
    if !entities.contains_key(&scoped) {
        return scoped;
    }
    let mut n = 2_u32;
    loop {
        let candidate = format!("{scoped}_{n}");
        if !entities.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

enum IngestCommand {
    Observe(Vec<Observation>, oneshot::Sender<Vec<MergeOutcome>>),
    Remove(String, RemovalCause, oneshot::Sender<bool>),
}

/// Cloneable sender side of the ordered ingest queue.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<IngestCommand>,
}

impl std::fmt::Debug for IngestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl IngestHandle {
    /// Queues observations from one message and waits for their outcomes.
    pub async fn submit(&self, observations: Vec<Observation>) -> Result<Vec<MergeOutcome>, FusionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(IngestCommand::Observe(observations, reply))
            .await
            .map_err(|_| FusionError::WorkerStopped)?;
        rx.await.map_err(|_| FusionError::WorkerStopped)
    }

    /// Queues a removal behind any pending observations.
    pub async fn remove(&self, entity_id: impl Into<String>, cause: RemovalCause) -> Result<bool, FusionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(IngestCommand::Remove(entity_id.into(), cause, reply))
            .await
            .map_err(|_| FusionError::WorkerStopped)?;
        rx.await.map_err(|_| FusionError::WorkerStopped)
    }
}
