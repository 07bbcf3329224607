use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;
use tifda_cop::{
    geo::haversine_km,
    model::{CopSnapshot, EntityCop, IffClassification, ThreatAssessment, ThreatLevel},
    telemetry::Telemetry,
};
use uuid::Uuid;

use crate::{
    config::DisseminationConfig,
    review::{ReviewQueue, ReviewSubject},
};

/// Produces threat assessments for entities of a snapshot.
///
/// Implementations may be slow or wrong; callers bound every call with a
/// timeout and route low-confidence answers to a reviewer.
#[async_trait]
pub trait ThreatEvaluator: Send + Sync {
    /// Assessment of `entity` in the context of `snapshot`, or `None` when it poses no threat.
    async fn evaluate(&self, entity: &EntityCop, snapshot: &CopSnapshot) -> Result<Option<ThreatAssessment>>;
}

/// Threat multiplier per entity type.
#[must_use]
pub fn type_multiplier(entity_type: &str) -> f64 {
    match entity_type.trim().to_ascii_lowercase().as_str() {
        "missile" => 3.0,
        "fighter" | "bomber" => 2.5,
        "aircraft" => 2.0,
        "helicopter" => 1.8,
        "submarine" => 1.6,
        "uav" | "drone" | "tank" | "artillery" => 1.5,
        "destroyer" => 1.4,
        "ship" => 1.3,
        "infantry" => 0.8,
        "person" => 0.5,
        "base" => 0.3,
        "building" | "infrastructure" => 0.2,
        _ => 1.0,
    }
}

/// Score in [0, 100]: IFF base × type × proximity × confidence.
#[must_use]
pub fn threat_score(entity: &EntityCop, nearest_friendly_km: Option<f64>) -> f64 {
    let base = match entity.classification {
        IffClassification::Hostile => 80.0,
        IffClassification::Unknown => 50.0,
        IffClassification::Neutral => 20.0,
        IffClassification::Friendly => 0.0,
    };
    let proximity = match nearest_friendly_km {
        Some(d) if d < 10.0 => 2.0,
        Some(d) if d < 50.0 => 1.5,
        Some(d) if d < 100.0 => 1.2,
        Some(d) if d < 200.0 => 1.0,
        _ => 0.5,
    };
    let confidence_factor = 0.8f64.mul_add(entity.confidence, 0.2);
    (base * type_multiplier(&entity.entity_type) * proximity * confidence_factor).clamp(0.0, 100.0)
}

/// Level for clear-cut cases; `None` when only a score can decide.
#[must_use]
pub fn obvious_level(entity: &EntityCop, nearest_friendly_km: Option<f64>) -> Option<ThreatLevel> {
    let hostile = entity.classification == IffClassification::Hostile;
    let kind = entity.entity_type.trim().to_ascii_lowercase();
    let near = |limit: f64| nearest_friendly_km.is_some_and(|d| d < limit);
    if hostile && kind == "missile" {
        Some(ThreatLevel::Critical)
    } else if hostile && matches!(kind.as_str(), "aircraft" | "fighter" | "bomber") && near(10.0) {
        Some(ThreatLevel::Critical)
    } else if entity.classification == IffClassification::Unknown
        && entity.speed_kmh.is_some_and(|s| s > 700.0)
        && near(50.0)
    {
        Some(ThreatLevel::High)
    } else if hostile && near(30.0) {
        Some(ThreatLevel::High)
    } else {
        None
    }
}

fn level_for_score(score: f64) -> ThreatLevel {
    if score >= 80.0 {
        ThreatLevel::Critical
    } else if score >= 60.0 {
        ThreatLevel::High
    } else if score >= 35.0 {
        ThreatLevel::Medium
    } else {
        ThreatLevel::Low
    }
}

/// Deterministic evaluator standing in for a model-backed one.
#[derive(Debug, Clone, Copy)]
pub struct RuleThreatEvaluator {
    affected_radius_km: f64,
}

impl RuleThreatEvaluator {
    /// Friendly entities within `affected_radius_km` count as affected.
    #[must_use]
    pub const fn new(affected_radius_km: f64) -> Self {
        Self { affected_radius_km }
    }

    /// Synchronous core of [`ThreatEvaluator::evaluate`].
    #[must_use]
    pub fn assess(&self, entity: &EntityCop, snapshot: &CopSnapshot) -> Option<ThreatAssessment> {
        if !matches!(
            entity.classification,
            IffClassification::Hostile | IffClassification::Unknown
        ) {
            return None;
        }
        let mut friendlies: Vec<(&str, f64)> = snapshot
            .entities
            .values()
            .filter(|other| other.entity_id != entity.entity_id)
            .filter(|other| other.classification == IffClassification::Friendly)
            .map(|other| (other.entity_id.as_str(), haversine_km(&entity.location, &other.location)))
            .collect();
        friendlies.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        let nearest = friendlies.first().map(|(_, d)| *d);

        let score = threat_score(entity, nearest);
        let (threat_level, confidence, basis) = obvious_level(entity, nearest).map_or_else(
            || (level_for_score(score), entity.confidence * 0.75, "score"),
            |level| (level, entity.confidence, "rule"),
        );
        let distances_to_affected_km: BTreeMap<String, f64> = friendlies
            .iter()
            .take_while(|(_, d)| *d <= self.affected_radius_km)
            .map(|(id, d)| ((*id).to_string(), (d * 100.0).round() / 100.0))
            .collect();
        Some(ThreatAssessment {
            assessment_id: format!("threat-{}", Uuid::new_v4()),
            threat_source_id: entity.entity_id.clone(),
            threat_level,
            affected_entities: distances_to_affected_km.keys().cloned().collect(),
            distances_to_affected_km,
            reasoning: format!(
                "{} {} scored {score:.1} ({basis}); nearest friendly {}",
                entity.classification,
                entity.entity_type,
                nearest.map_or_else(|| "unknown".to_string(), |d| format!("{d:.1} km")),
            ),
            confidence: confidence.clamp(0.0, 1.0),
            timestamp: Utc::now(),
        })
    }
}

impl Default for RuleThreatEvaluator {
    fn default() -> Self {
        Self::new(DisseminationConfig::default().affected_radius_km)
    }
}

#[async_trait]
impl ThreatEvaluator for RuleThreatEvaluator {
    async fn evaluate(&self, entity: &EntityCop, snapshot: &CopSnapshot) -> Result<Option<ThreatAssessment>> {
        Ok(self.assess(entity, snapshot))
    }
}

/// Result of one evaluation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AssessmentCycle {
    /// Assessments approved without a reviewer.
    pub approved: Vec<ThreatAssessment>,
    /// Review ids of low-confidence assessments.
    pub queued: Vec<Uuid>,
    /// Entities whose evaluation failed or timed out; retried next pass.
    pub failed: Vec<String>,
}

/// Runs an evaluator over a snapshot and files the results with the review queue.
#[derive(Clone)]
pub struct ThreatAssessor {
    evaluator: Arc<dyn ThreatEvaluator>,
    review: ReviewQueue,
    timeout: Duration,
    min_confidence: f64,
    telemetry: Telemetry,
}

impl std::fmt::Debug for ThreatAssessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreatAssessor")
            .field("timeout", &self.timeout)
            .field("min_confidence", &self.min_confidence)
            .finish_non_exhaustive()
    }
}

impl ThreatAssessor {
    /// Creates an assessor.
    #[must_use]
    pub fn new(
        evaluator: Arc<dyn ThreatEvaluator>,
        review: ReviewQueue,
        config: &DisseminationConfig,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            evaluator,
            review,
            timeout: Duration::from_millis(config.threat_timeout_ms),
            min_confidence: config.min_threat_confidence,
            telemetry,
        }
    }

    /// Evaluates every hostile or unknown entity, concurrently, each under the timeout.
    pub async fn assess(&self, snapshot: &CopSnapshot) -> AssessmentCycle {
        let candidates = snapshot.entities.values().filter(|entity| {
            matches!(
                entity.classification,
                IffClassification::Hostile | IffClassification::Unknown
            )
        });
        let calls = candidates.map(|entity| async move {
            let outcome = tokio::time::timeout(self.timeout, self.evaluator.evaluate(entity, snapshot)).await;
            (entity.entity_id.clone(), outcome)
        });
        let results = futures::future::join_all(calls).await;

        let mut cycle = AssessmentCycle::default();
        for (entity_id, outcome) in results {
            match outcome {
                Ok(Ok(Some(assessment))) => {
                    if assessment.confidence >= self.min_confidence {
                        self.review
                            .record_approved(ReviewSubject::Threat(assessment.clone()), "auto");
                        cycle.approved.push(assessment);
                    } else {
                        let reason = format!(
                            "confidence {:.2} below {:.2}",
                            assessment.confidence, self.min_confidence
                        );
                        cycle
                            .queued
                            .push(self.review.submit(ReviewSubject::Threat(assessment), vec![reason]));
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(err)) => {
                    let _ = self.telemetry.log(
                        LogLevel::Warn,
                        "dissemination.threat.failed",
                        json!({ "entity_id": entity_id, "error": err.to_string() }),
                    );
                    cycle.failed.push(entity_id);
                }
                Err(_) => {
                    let _ = self.telemetry.log(
                        LogLevel::Warn,
                        "dissemination.threat.timeout",
                        json!({ "entity_id": entity_id, "timeout_ms": self.timeout.as_millis() }),
                    );
                    cycle.failed.push(entity_id);
                }
            }
        }
        let _ = self.telemetry.event(
            "dissemination.threat.cycle",
            json!({
                "snapshot_version": snapshot.version,
                "approved": cycle.approved.len(),
                "queued": cycle.queued.len(),
                "failed": cycle.failed.len(),
            }),
        );
        cycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tifda_cop::model::Location;

    fn entity(id: &str, entity_type: &str, iff: IffClassification, lat: f64) -> EntityCop {
        let mut entity = EntityCop::new(id, entity_type, Location::new(lat, -0.4), Utc::now(), 0.9);
        entity.classification = iff;
        entity
    }

    fn snapshot(entities: Vec<EntityCop>) -> CopSnapshot {
        CopSnapshot {
            version: 1,
            taken_at: Utc::now(),
            entities: entities.into_iter().map(|e| (e.entity_id.clone(), e)).collect(),
        }
    }

    struct Slow;

    #[async_trait]
    impl ThreatEvaluator for Slow {
        async fn evaluate(&self, _: &EntityCop, _: &CopSnapshot) -> Result<Option<ThreatAssessment>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }
    }

    #[test]
    fn hostile_missile_is_critical() {
        let snap = snapshot(vec![
            entity("m1", "missile", IffClassification::Hostile, 39.6),
            entity("base_alpha", "base", IffClassification::Friendly, 39.5),
        ]);
        let assessment = RuleThreatEvaluator::default().assess(&snap.entities["m1"], &snap).unwrap();
        assert_eq!(assessment.threat_level, ThreatLevel::Critical);
        assert_eq!(assessment.affected_entities, vec!["base_alpha".to_string()]);
        assert!((assessment.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn friendlies_are_not_threats() {
        let snap = snapshot(vec![entity("f1", "tank", IffClassification::Friendly, 39.5)]);
        assert!(RuleThreatEvaluator::default().assess(&snap.entities["f1"], &snap).is_none());
    }

    #[test]
    fn distant_unknowns_score_low_with_reduced_confidence() {
        let snap = snapshot(vec![
            entity("u1", "truck", IffClassification::Unknown, 45.0),
            entity("base_alpha", "base", IffClassification::Friendly, 39.5),
        ]);
        let assessment = RuleThreatEvaluator::default().assess(&snap.entities["u1"], &snap).unwrap();
        assert_eq!(assessment.threat_level, ThreatLevel::Low);
        assert!(assessment.affected_entities.is_empty());
        assert!(assessment.confidence < 0.7);
    }

    #[tokio::test]
    async fn low_confidence_goes_to_review() {
        let review = ReviewQueue::new(Telemetry::in_memory("review"));
        let assessor = ThreatAssessor::new(
            Arc::new(RuleThreatEvaluator::default()),
            review.clone(),
            &DisseminationConfig::default(),
            Telemetry::in_memory("threat"),
        );
        let mut doubtful = entity("u1", "truck", IffClassification::Unknown, 45.0);
        doubtful.confidence = 0.6;
        let snap = snapshot(vec![
            entity("m1", "missile", IffClassification::Hostile, 39.6),
            doubtful,
            entity("base_alpha", "base", IffClassification::Friendly, 39.5),
        ]);
        let cycle = assessor.assess(&snap).await;
        assert_eq!(cycle.approved.len(), 1);
        assert_eq!(cycle.queued.len(), 1);
        assert_eq!(review.approved_threats().len(), 1);
        assert_eq!(review.pending().len(), 1);

        let again = assessor.assess(&snap).await;
        assert_eq!(again.queued, cycle.queued);
        assert_eq!(review.pending().len(), 1);
        assert_eq!(review.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_reported_not_fatal() {
        let assessor = ThreatAssessor::new(
            Arc::new(Slow),
            ReviewQueue::new(Telemetry::in_memory("review")),
            &DisseminationConfig::default(),
            Telemetry::in_memory("threat"),
        );
        let snap = snapshot(vec![entity("h1", "tank", IffClassification::Hostile, 39.6)]);
        let cycle = assessor.assess(&snap).await;
        assert_eq!(cycle.failed, vec!["h1".to_string()]);
        assert!(cycle.approved.is_empty());
    }
}
