use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::{AuditComponent, AuditOutcome, AuditRecord, LogLevel};
use tifda_cop::{
    model::{CopSnapshot, EntityCop, InformationClassification, Location, ThreatAssessment, ThreatLevel},
    telemetry::Telemetry,
};
use uuid::Uuid;

use crate::{
    clearance::{self, downgrade, public_view},
    config::DisseminationConfig,
    deception::DecoyGenerator,
    need_to_know::{self, ThreatIndex},
    recipient::{resolve_all, PolicyError, RecipientConfig, RecipientSpec},
};

/// What one recipient is cleared and entitled to receive from one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisseminationDecision {
    /// Decision id.
    pub decision_id: Uuid,
    /// Target recipient.
    pub recipient_id: String,
    /// Ids of every entity in the payload, decoys included.
    pub information_subset: Vec<String>,
    /// Outbound entity views, in `information_subset` order.
    pub entities: Vec<EntityCop>,
    /// Ids in the subset that are fabricated. Nothing else marks a decoy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decoy_ids: Vec<String>,
    /// Most sensitive label in the payload.
    pub highest_classification_sent: InformationClassification,
    /// Whether a reviewer must release it.
    pub requires_human_approval: bool,
    /// Why approval is required.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approval_reasons: Vec<String>,
    /// Adversarial channel traffic.
    pub is_deception: bool,
    /// Most severe linked threat; drives delivery priority.
    pub criticality: ThreatLevel,
    /// Snapshot the decision was computed from.
    pub snapshot_version: u64,
    /// When the decision was made.
    pub created_at: DateTime<Utc>,
}

impl DisseminationDecision {
    /// Whether `entity_id` in this payload is fabricated.
    #[must_use]
    pub fn is_decoy(&self, entity_id: &str) -> bool {
        self.decoy_ids.iter().any(|id| id == entity_id)
    }
}

/// Decisions for one snapshot plus the recipients or assessments that were skipped.
#[derive(Debug, Clone, Default)]
pub struct DecisionRound {
    /// One decision per recipient with a non-empty subset.
    pub decisions: Vec<DisseminationDecision>,
    /// Skipped recipients and dangling assessments.
    pub errors: Vec<PolicyError>,
    /// Recipients that resolved correctly.
    pub recipients: Vec<RecipientConfig>,
}

/// Per-recipient decision engine.
///
/// Works on snapshots only: never touches the store.
#[derive(Debug, Clone)]
pub struct DisseminationEngine {
    config: DisseminationConfig,
    decoys: DecoyGenerator,
    telemetry: Telemetry,
}

impl DisseminationEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new(config: DisseminationConfig, telemetry: Telemetry) -> Self {
        let decoys = DecoyGenerator::new(config.decoys_per_decision, config.decoy_seed);
        Self {
            config,
            decoys,
            telemetry,
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &DisseminationConfig {
        &self.config
    }

    /// Resolves raw recipient entries and decides for each usable one.
    #[must_use]
    pub fn decide(
        &self,
        snapshot: &CopSnapshot,
        approved_threats: &[ThreatAssessment],
        specs: &[RecipientSpec],
    ) -> DecisionRound {
        let (recipients, mut errors) = resolve_all(specs);
        for error in &errors {
            self.record_config_error(error);
        }
        for assessment in approved_threats {
            if snapshot.get(&assessment.threat_source_id).is_none() {
                let error = PolicyError::UnknownThreatSource {
                    assessment_id: assessment.assessment_id.clone(),
                    entity_id: assessment.threat_source_id.clone(),
                };
                let _ = self.telemetry.log(
                    LogLevel::Warn,
                    "dissemination.threat.dangling",
                    json!({ "error": error.to_string() }),
                );
                errors.push(error);
            }
        }
        let threats = ThreatIndex::new(approved_threats);
        let decisions = recipients
            .iter()
            .filter_map(|recipient| self.decide_for(snapshot, &threats, recipient))
            .collect();
        DecisionRound {
            decisions,
            errors,
            recipients,
        }
    }

    /// Decision for one validated recipient; `None` when nothing is releasable.
    #[must_use]
    pub fn decide_for(
        &self,
        snapshot: &CopSnapshot,
        threats: &ThreatIndex<'_>,
        recipient: &RecipientConfig,
    ) -> Option<DisseminationDecision> {
        let clearance = recipient.max_classification();
        let visible = clearance::filter(snapshot.entities.values(), clearance);
        let excluded = snapshot.len() - visible.len();
        if excluded > 0 {
            let _ = self.telemetry.audit(
                AuditRecord::new(
                    AuditComponent::Classification,
                    [recipient.recipient_id.clone()],
                    AuditOutcome::Withheld,
                    "above recipient clearance",
                )
                .with_details(json!({
                    "clearance": clearance,
                    "excluded": excluded,
                    "snapshot_version": snapshot.version,
                })),
            );
        }

        let mut approval_reasons = Vec::new();
        let mut criticality = ThreatLevel::Low;
        let mut entities = Vec::new();
        for entity in visible {
            let Some(relevance) = need_to_know::assess(entity, recipient, threats, &self.config.bands) else {
                continue;
            };
            if relevance.ambiguous {
                approval_reasons.push(format!("need-to-know for {} is ambiguous", entity.entity_id));
            }
            if let Some(level) = relevance.threat_level() {
                criticality = criticality.max(level);
            }
            entities.push(if recipient.is_enemy() {
                public_view(entity)
            } else {
                downgrade(entity, clearance)
            });
        }
        if entities.is_empty() {
            self.record_withheld(recipient, snapshot.version);
            return None;
        }

        let mut decoy_ids = Vec::new();
        if recipient.is_enemy() {
            approval_reasons.insert(0, "adversarial channel".to_string());
            let around = recipient
                .reference()
                .unwrap_or_else(|| centroid(&entities));
            let taken: HashSet<&str> = snapshot.entities.keys().map(String::as_str).collect();
            let decoys = self.decoys.generate(
                &recipient.recipient_id,
                snapshot.version,
                around,
                &entities,
                &taken,
            );
            decoy_ids = decoys.iter().map(|d| d.entity_id.clone()).collect();
            entities.extend(decoys);
            entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        }

        let highest_classification_sent = entities
            .iter()
            .map(|e| e.information_classification)
            .max()
            .unwrap_or_default();
        if highest_classification_sent == InformationClassification::TopSecret {
            approval_reasons.push("payload contains TOP_SECRET".to_string());
        }
        let decision = DisseminationDecision {
            decision_id: Uuid::new_v4(),
            recipient_id: recipient.recipient_id.clone(),
            information_subset: entities.iter().map(|e| e.entity_id.clone()).collect(),
            entities,
            decoy_ids,
            highest_classification_sent,
            requires_human_approval: !approval_reasons.is_empty(),
            approval_reasons,
            is_deception: recipient.is_enemy(),
            criticality,
            snapshot_version: snapshot.version,
            created_at: Utc::now(),
        };
        self.record_decision(&decision);
        Some(decision)
    }

    fn record_decision(&self, decision: &DisseminationDecision) {
        let outcome = if decision.requires_human_approval {
            AuditOutcome::Flagged
        } else {
            AuditOutcome::Released
        };
        let details = json!({
            "decision_id": decision.decision_id,
            "recipient_id": decision.recipient_id,
            "entities": decision.information_subset.len(),
            "decoys": decision.decoy_ids.len(),
            "highest_classification_sent": decision.highest_classification_sent,
            "requires_human_approval": decision.requires_human_approval,
            "is_deception": decision.is_deception,
        });
        let _ = self.telemetry.audit(
            AuditRecord::new(
                AuditComponent::Dissemination,
                decision.information_subset.iter().cloned(),
                outcome,
                if decision.requires_human_approval {
                    decision.approval_reasons.join("; ")
                } else {
                    "cleared and relevant".to_string()
                },
            )
            .with_details(details.clone()),
        );
        let _ = self.telemetry.event("dissemination.decision.created", details);
    }

    fn record_withheld(&self, recipient: &RecipientConfig, version: u64) {
        let _ = self.telemetry.audit(
            AuditRecord::new(
                AuditComponent::Dissemination,
                [recipient.recipient_id.clone()],
                AuditOutcome::Withheld,
                "nothing releasable",
            )
            .with_details(json!({ "snapshot_version": version })),
        );
    }

    fn record_config_error(&self, error: &PolicyError) {
        let id = match error {
            PolicyError::Recipient { recipient_id, .. } => recipient_id.clone(),
            PolicyError::UnknownThreatSource { assessment_id, .. } => assessment_id.clone(),
        };
        let _ = self.telemetry.log(
            LogLevel::Error,
            "dissemination.recipient.invalid",
            json!({ "error": error.to_string() }),
        );
        let _ = self.telemetry.audit(AuditRecord::new(
            AuditComponent::Dissemination,
            [id],
            AuditOutcome::ConfigError,
            error.to_string(),
        ));
    }
}

fn centroid(entities: &[EntityCop]) -> Location {
    let count = entities.len().max(1) as f64;
    let (lat, lon) = entities
        .iter()
        .fold((0.0, 0.0), |(lat, lon), e| (lat + e.location.lat, lon + e.location.lon));
    Location::new(lat / count, lon / count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipient::AreaOfResponsibility;
    use std::collections::BTreeMap;
    use tifda_cop::model::IffClassification;

    fn entity(id: &str, level: InformationClassification, lat: f64) -> EntityCop {
        let mut entity = EntityCop::new(id, "tank", Location::new(lat, -0.4), Utc::now(), 0.8);
        entity.information_classification = level;
        entity.classification = IffClassification::Hostile;
        entity.source_sensors = ["radar_01".to_string()].into_iter().collect();
        entity.speed_kmh = Some(42.0);
        entity
    }

    fn snapshot(entities: Vec<EntityCop>) -> CopSnapshot {
        CopSnapshot {
            version: 9,
            taken_at: Utc::now(),
            entities: entities.into_iter().map(|e| (e.entity_id.clone(), e)).collect(),
        }
    }

    fn area() -> AreaOfResponsibility {
        AreaOfResponsibility::BoundingBox {
            min_lat: 39.0,
            min_lon: -1.0,
            max_lat: 40.0,
            max_lon: 0.0,
        }
    }

    fn spec(id: &str, access: &str) -> RecipientSpec {
        RecipientSpec {
            area: Some(area()),
            ..RecipientSpec::new(id, access)
        }
    }

    fn engine() -> DisseminationEngine {
        DisseminationEngine::new(DisseminationConfig::default(), Telemetry::in_memory("dissemination"))
    }

    fn mixed_picture() -> CopSnapshot {
        snapshot(vec![
            entity("ts", InformationClassification::TopSecret, 39.5),
            entity("s", InformationClassification::Secret, 39.4),
            entity("c", InformationClassification::Confidential, 39.3),
            entity("u", InformationClassification::Unclassified, 39.2),
            entity("outside", InformationClassification::Unclassified, 45.0),
        ])
    }

    #[test]
    fn secret_recipient_never_sees_top_secret() {
        let round = engine().decide(&mixed_picture(), &[], &[spec("base_alpha", "secret_access")]);
        assert!(round.errors.is_empty());
        let decision = &round.decisions[0];
        assert_eq!(decision.information_subset, ["c", "s", "u"]);
        assert_eq!(decision.highest_classification_sent, InformationClassification::Secret);
        assert!(!decision.requires_human_approval);
        assert!(!decision.is_deception);
        for entity in &decision.entities {
            assert!(clearance::clearance_satisfies(
                InformationClassification::Secret,
                entity.information_classification
            ));
        }
    }

    #[test]
    fn top_secret_payload_needs_approval() {
        let round = engine().decide(&mixed_picture(), &[], &[spec("hq", "top_secret_access")]);
        let decision = &round.decisions[0];
        assert_eq!(decision.highest_classification_sent, InformationClassification::TopSecret);
        assert!(decision.requires_human_approval);
    }

    #[test]
    fn enemy_channel_gets_unclassified_plus_decoys() {
        let round = engine().decide(&mixed_picture(), &[], &[spec("red", "enemy_access")]);
        let decision = &round.decisions[0];
        assert!(decision.is_deception);
        assert!(decision.requires_human_approval);
        assert_eq!(decision.highest_classification_sent, InformationClassification::Unclassified);
        assert_eq!(decision.decoy_ids.len(), 3);
        assert_eq!(decision.information_subset.len(), 4);
        assert!(decision.information_subset.contains(&"u".to_string()));
        for entity in &decision.entities {
            assert_eq!(entity.information_classification, InformationClassification::Unclassified);
            assert!(entity.source_sensors.is_empty());
            assert!(entity.speed_kmh.is_none());
            assert!(entity.contributions.is_empty());
        }
        assert!(decision.decoy_ids.iter().all(|id| decision.is_decoy(id)));
        assert!(!decision.is_decoy("u"));
        let mut sorted = decision.information_subset.clone();
        sorted.sort();
        assert_eq!(sorted, decision.information_subset);
    }

    #[test]
    fn empty_subsets_produce_no_decision() {
        let picture = snapshot(vec![entity("ts", InformationClassification::TopSecret, 39.5)]);
        let round = engine().decide(
            &picture,
            &[],
            &[spec("base_alpha", "secret_access"), spec("red", "enemy_access")],
        );
        assert!(round.decisions.is_empty());
        assert_eq!(round.recipients.len(), 2);
    }

    #[test]
    fn malformed_recipient_is_skipped_and_audited() {
        let engine = engine();
        let round = engine.decide(
            &mixed_picture(),
            &[],
            &[spec("bad", "ultra_access"), spec("base_alpha", "secret_access")],
        );
        assert_eq!(round.decisions.len(), 1);
        assert_eq!(round.decisions[0].recipient_id, "base_alpha");
        assert_eq!(round.errors.len(), 1);
        let config_errors: Vec<_> = engine
            .telemetry
            .audit_trail()
            .records()
            .into_iter()
            .filter(|r| r.outcome == AuditOutcome::ConfigError)
            .collect();
        assert_eq!(config_errors.len(), 1);
    }

    #[test]
    fn threat_links_raise_criticality_and_ambiguity() {
        let picture = snapshot(vec![entity("h1", InformationClassification::Secret, 40.3)]);
        let threat = ThreatAssessment {
            assessment_id: "a1".into(),
            threat_source_id: "h1".into(),
            threat_level: ThreatLevel::High,
            affected_entities: vec!["depot".into()],
            distances_to_affected_km: BTreeMap::new(),
            reasoning: String::new(),
            confidence: 0.9,
            timestamp: Utc::now(),
        };
        let mut recipient = spec("base_alpha", "secret_access");
        recipient.assets = vec!["depot".into()];
        recipient.reference_point = Some(Location::new(40.0, -0.4));
        let round = engine().decide(&picture, &[threat.clone()], &[recipient]);
        let decision = &round.decisions[0];
        assert_eq!(decision.criticality, ThreatLevel::High);
        assert!(decision.requires_human_approval);

        let dangling = ThreatAssessment {
            threat_source_id: "gone".into(),
            ..threat
        };
        let round = engine().decide(&picture, &[dangling], &[spec("base_alpha", "secret_access")]);
        assert!(matches!(round.errors[0], PolicyError::UnknownThreatSource { .. }));
    }
}
