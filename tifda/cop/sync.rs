use std::{collections::BTreeSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::{AuditComponent, AuditOutcome, AuditRecord, LogLevel};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    fusion::{FusionEngine, RemovalCause},
    model::{CopSnapshot, EntityCop},
    retry::RetryPolicy,
    telemetry::Telemetry,
};

/// One change pushed to the visualization mirror.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MirrorOp {
    /// Create or replace an entity.
    Upsert {
        /// Current canonical state.
        entity: EntityCop,
    },
    /// Delete an entity.
    Remove {
        /// Deleted id.
        entity_id: String,
    },
}

/// Mirror failures; never propagated into the store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Worth retrying (timeouts, 5xx).
    #[error("transient mirror failure: {0}")]
    Transient(String),
    /// Retrying will not help (4xx, bad configuration).
    #[error("permanent mirror failure: {0}")]
    Permanent(String),
}

/// External visualization store kept in step with the COP.
#[async_trait]
pub trait VisualizationMirror: Send + Sync {
    /// Applies a batch of operations.
    async fn apply(&self, batch: &[MirrorOp]) -> Result<(), SyncError>;

    /// Ids deleted on the mirror side since the last call.
    async fn deleted_entities(&self) -> Result<Vec<String>, SyncError> {
        Ok(Vec::new())
    }
}

/// Mirror follower settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the mirror API; sync is off when absent.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Operations per request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Request timeout, milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Backoff between failed batches.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            batch_size: default_batch_size(),
            timeout_ms: default_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

const fn default_batch_size() -> usize {
    50
}

const fn default_timeout_ms() -> u64 {
    3_000
}

/// Follower counters.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SyncStats {
    /// Store version the mirror last acknowledged.
    pub synced_version: u64,
    /// Batches accepted by the mirror.
    pub batches_sent: u64,
    /// Operations accepted by the mirror.
    pub operations_sent: u64,
    /// Failed attempts (including retried ones).
    pub failed_attempts: u64,
    /// Entities removed because the mirror deleted them.
    pub external_deletions: u64,
}

/// Operations that turn `previous` into `current`, removals first.
#[must_use]
pub fn diff(previous: &CopSnapshot, current: &CopSnapshot) -> Vec<MirrorOp> {
    let mut ops: Vec<MirrorOp> = previous
        .entities
        .keys()
        .filter(|id| !current.entities.contains_key(*id))
        .map(|id| MirrorOp::Remove {
            entity_id: id.clone(),
        })
        .collect();
    ops.extend(
        current
            .entities
            .values()
            .filter(|entity| previous.entities.get(&entity.entity_id) != Some(*entity))
            .map(|entity| MirrorOp::Upsert {
                entity: entity.clone(),
            }),
    );
    ops
}

/// Background follower pushing store changes to a mirror.
///
/// Mirror failures are retried on their own schedule and never block or
/// roll back fusion.
pub struct MirrorSync {
    engine: Arc<FusionEngine>,
    mirror: Arc<dyn VisualizationMirror>,
    config: SyncConfig,
    telemetry: Telemetry,
    acked: Mutex<Arc<CopSnapshot>>,
    stats: Mutex<SyncStats>,
}

impl std::fmt::Debug for MirrorSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorSync")
            .field("config", &self.config)
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

impl MirrorSync {
    /// Creates a follower starting from an empty mirror.
    #[must_use]
    pub fn new(
        engine: Arc<FusionEngine>,
        mirror: Arc<dyn VisualizationMirror>,
        config: SyncConfig,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            engine,
            mirror,
            config,
            telemetry,
            acked: Mutex::new(Arc::new(CopSnapshot::empty())),
            stats: Mutex::new(SyncStats::default()),
        }
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }

    /// Pushes everything changed since the last acknowledged snapshot, then
    /// applies deletions reported by the mirror. Returns the number of operations sent.
    pub async fn sync_once(&self) -> Result<usize, SyncError> {
        let current = self.engine.snapshot();
        let previous = Arc::clone(&self.acked.lock());
        let ops = diff(&previous, &current);
        for batch in ops.chunks(self.config.batch_size.max(1)) {
            self.push(batch).await?;
        }
        {
            let mut stats = self.stats.lock();
            stats.synced_version = current.version;
        }
        *self.acked.lock() = Arc::clone(&current);
        self.pull_deletions().await?;
        Ok(ops.len())
    }

    async fn push(&self, batch: &[MirrorOp]) -> Result<(), SyncError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.mirror.apply(batch).await {
                Ok(()) => {
                    let mut stats = self.stats.lock();
                    stats.batches_sent += 1;
                    stats.operations_sent += batch.len() as u64;
                    return Ok(());
                }
                Err(err) => {
                    self.stats.lock().failed_attempts += 1;
                    let retry = matches!(err, SyncError::Transient(_))
                        && self.config.retry.allows_retry(attempt);
                    let _ = self.telemetry.log(
                        LogLevel::Warn,
                        "cop.sync.batch_failed",
                        json!({ "attempt": attempt, "error": err.to_string(), "retry": retry }),
                    );
                    if !retry {
                        let _ = self.telemetry.audit(
                            AuditRecord::new(
                                AuditComponent::Sync,
                                batch.iter().map(op_id),
                                AuditOutcome::Failed,
                                err.to_string(),
                            )
                            .with_details(json!({ "attempts": attempt })),
                        );
                        return Err(err);
                    }
                    tokio::time::sleep(self.config.retry.delay_after(attempt)).await;
                }
            }
        }
    }

    async fn pull_deletions(&self) -> Result<(), SyncError> {
        let deleted: BTreeSet<String> = self.mirror.deleted_entities().await?.into_iter().collect();
        if deleted.is_empty() {
            return Ok(());
        }
        let mut removed = 0_u64;
        for entity_id in &deleted {
            if self
                .engine
                .remove(entity_id, RemovalCause::ExternalSync)
                .is_some()
            {
                removed += 1;
            }
        }
        {
            let mut acked = self.acked.lock();
            let mut pruned = (**acked).clone();
            pruned.entities.retain(|id, _| !deleted.contains(id));
            *acked = Arc::new(pruned);
        }
        self.stats.lock().external_deletions += removed;
        Ok(())
    }

    /// Runs the follower until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut updates = self.engine.subscribe();
            loop {
                match self.sync_once().await {
                    Ok(_) => {
                        if updates.changed().await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = self.telemetry.event(
                            "cop.sync.failed",
                            json!({ "error": err.to_string() }),
                        );
                        tokio::time::sleep(Duration::from_millis(self.config.retry.max_delay_ms))
                            .await;
                    }
                }
            }
        })
    }
}

fn op_id(op: &MirrorOp) -> String {
    match op {
        MirrorOp::Upsert { entity } => entity.entity_id.clone(),
        MirrorOp::Remove { entity_id } => entity_id.clone(),
    }
}

/// Mirror reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpMirror {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpMirror {
    /// Creates a client with the configured timeout.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::Permanent(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    /// Builds a mirror from configuration when an endpoint is set.
    pub fn from_config(config: &SyncConfig) -> Result<Option<Self>, SyncError> {
        config
            .endpoint
            .as_deref()
            .map(|endpoint| Self::new(endpoint, Duration::from_millis(config.timeout_ms)))
            .transpose()
    }
}

fn classify_status(status: reqwest::StatusCode) -> Result<(), SyncError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        Err(SyncError::Transient(format!("mirror returned {status}")))
    } else {
        Err(SyncError::Permanent(format!("mirror returned {status}")))
    }
}

fn classify_transport(err: &reqwest::Error) -> SyncError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        SyncError::Transient(err.to_string())
    } else {
        SyncError::Permanent(err.to_string())
    }
}

#[async_trait]
impl VisualizationMirror for HttpMirror {
    async fn apply(&self, batch: &[MirrorOp]) -> Result<(), SyncError> {
        let response = self
            .client
            .post(format!("{}/entities/batch", self.endpoint))
            .json(&json!({ "operations": batch }))
            .send()
            .await
            .map_err(|err| classify_transport(&err))?;
        classify_status(response.status())
    }

    async fn deleted_entities(&self) -> Result<Vec<String>, SyncError> {
        let response = self
            .client
            .get(format!("{}/entities/deleted", self.endpoint))
            .send()
            .await
            .map_err(|err| classify_transport(&err))?;
        classify_status(response.status())?;
        response
            .json::<Vec<String>>()
            .await
            .map_err(|err| SyncError::Permanent(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::FusionConfig,
        fusion::Observation,
        model::{InformationClassification, Location, SensorType},
    };
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FlakyMirror {
        failures_left: AtomicUsize,
        applied: Mutex<Vec<MirrorOp>>,
        deleted: Mutex<Vec<String>>,
        permanent: bool,
    }

    #[async_trait]
    impl VisualizationMirror for FlakyMirror {
        async fn apply(&self, batch: &[MirrorOp]) -> Result<(), SyncError> {
            if self.permanent {
                return Err(SyncError::Permanent("400".into()));
            }
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SyncError::Transient("503".into()));
            }
            self.applied.lock().extend_from_slice(batch);
            Ok(())
        }

        async fn deleted_entities(&self) -> Result<Vec<String>, SyncError> {
            Ok(std::mem::take(&mut *self.deleted.lock()))
        }
    }

    fn engine_with(ids: &[&str]) -> Arc<FusionEngine> {
        let engine = Arc::new(FusionEngine::new(FusionConfig::default(), Telemetry::in_memory("fusion")));
        for (offset, id) in (0_u32..).zip(ids) {
            let entity = EntityCop::new(*id, "tank", Location::new(40.0 + f64::from(offset), -3.0), Utc::now(), 0.8);
            engine.ingest(Observation::from_entity(
                &entity,
                "radar_01",
                SensorType::Radar,
                InformationClassification::Secret,
            ));
        }
        engine
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            batch_size: 1,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 2,
            },
            ..SyncConfig::default()
        }
    }

    #[test]
    fn diff_emits_removals_and_changed_upserts() {
        let engine = engine_with(&["a", "b"]);
        let before = engine.snapshot();
        engine.remove("a", RemovalCause::Explicit("test".into()));
        let entity = EntityCop::new("c", "ship", Location::new(30.0, 10.0), Utc::now(), 0.5);
        engine.ingest(Observation::from_entity(&entity, "radar_01", SensorType::Radar, InformationClassification::Secret));
        let ops = diff(&before, &engine.snapshot());
        assert_eq!(
            ops.iter().map(op_id).collect::<Vec<_>>(),
            vec!["a".to_string(), "c".to_string()]
        );
        assert!(matches!(ops[0], MirrorOp::Remove { .. }));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let engine = engine_with(&["a", "b"]);
        let mirror = Arc::new(FlakyMirror {
            failures_left: AtomicUsize::new(2),
            ..FlakyMirror::default()
        });
        let sync = MirrorSync::new(engine.clone(), mirror.clone(), fast_config(), Telemetry::in_memory("sync"));
        assert_eq!(sync.sync_once().await.unwrap(), 2);
        let stats = sync.stats();
        assert_eq!(stats.failed_attempts, 2);
        assert_eq!(stats.batches_sent, 2);
        assert_eq!(stats.synced_version, engine.snapshot().version);
        assert_eq!(sync.sync_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn permanent_failure_leaves_store_untouched() {
        let engine = engine_with(&["a"]);
        let mirror = Arc::new(FlakyMirror {
            permanent: true,
            ..FlakyMirror::default()
        });
        let sync = MirrorSync::new(engine.clone(), mirror, fast_config(), Telemetry::in_memory("sync"));
        assert!(matches!(sync.sync_once().await, Err(SyncError::Permanent(_))));
        assert_eq!(engine.len(), 1);
        assert_eq!(sync.stats().failed_attempts, 1);
        assert_eq!(sync.stats().synced_version, 0);
    }

    #[tokio::test]
    async fn mirror_deletions_flow_back_through_the_engine() {
        let engine = engine_with(&["a", "b"]);
        let mirror = Arc::new(FlakyMirror::default());
        mirror.deleted.lock().push("a".into());
        let sync = MirrorSync::new(engine.clone(), mirror.clone(), fast_config(), Telemetry::in_memory("sync"));
        sync.sync_once().await.unwrap();
        assert!(engine.get("a").is_none());
        assert_eq!(sync.stats().external_deletions, 1);
        assert_eq!(sync.sync_once().await.unwrap(), 0);
    }

    #[test]
    fn status_mapping() {
        assert!(classify_status(reqwest::StatusCode::OK).is_ok());
        assert!(matches!(
            classify_status(reqwest::StatusCode::BAD_GATEWAY),
            Err(SyncError::Transient(_))
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::NOT_FOUND),
            Err(SyncError::Permanent(_))
        ));
    }
}
