use serde_json::json;
use shared_logging::{AuditComponent, AuditOutcome, AuditRecord, LogLevel};
use thiserror::Error;
use tifda_cop::{
    model::{InformationClassification, ThreatLevel},
    telemetry::Telemetry,
};

use crate::{
    clearance::clearance_satisfies, engine::DisseminationDecision,
    recipient::RecipientConfig,
};

/// Why an outbound payload was stopped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReleaseViolation {
    /// Payload addressed to someone else.
    #[error("decision for '{decision}' routed to '{recipient}'")]
    WrongRecipient {
        /// Recipient named in the decision.
        decision: String,
        /// Recipient the payload was about to go to.
        recipient: String,
    },
    /// Nothing to send.
    #[error("empty payload")]
    EmptyPayload,
    /// Subset and payload disagree.
    #[error("payload does not match the decided subset")]
    SubsetMismatch,
    /// Entity above the recipient's clearance.
    #[error("entity '{entity_id}' is {classification}, recipient cleared to {clearance}")]
    AboveClearance {
        /// Offending entity.
        entity_id: String,
        /// Its label.
        classification: InformationClassification,
        /// Recipient clearance.
        clearance: InformationClassification,
    },
    /// Field on an adversarial channel that only exists above UNCLASSIFIED.
    #[error("entity '{entity_id}' carries '{field}' on an adversarial channel")]
    EnemyChannelLeak {
        /// Offending entity.
        entity_id: String,
        /// Field that must not be present.
        field: &'static str,
    },
    /// Adversarial traffic not marked for approval, or decoys on a normal channel.
    #[error("deception marking inconsistent with recipient")]
    DeceptionMismatch,
}

/// Final check on every outbound decision; a violation blocks the send.
#[derive(Debug, Clone)]
pub struct ReleaseGuard {
    telemetry: Telemetry,
}

impl ReleaseGuard {
    /// Creates a guard.
    #[must_use]
    pub const fn new(telemetry: Telemetry) -> Self {
        Self { telemetry }
    }

    /// Checks `decision` against `recipient`; violations are logged as security events.
    pub fn check(&self, decision: &DisseminationDecision, recipient: &RecipientConfig) -> Result<(), ReleaseViolation> {
        let result = inspect(decision, recipient);
        match &result {
            Ok(()) => {
                let _ = self.telemetry.audit(AuditRecord::new(
                    AuditComponent::Dissemination,
                    [decision.decision_id.to_string()],
                    AuditOutcome::Released,
                    format!("released to {}", recipient.recipient_id),
                ));
            }
            Err(violation) => {
                let details = json!({
                    "decision_id": decision.decision_id,
                    "recipient_id": recipient.recipient_id,
                    "violation": violation.to_string(),
                });
                let _ = self
                    .telemetry
                    .log(LogLevel::Error, "dissemination.release.blocked", details.clone());
                let _ = self.telemetry.event("security.release.blocked", details.clone());
                let _ = self.telemetry.audit(
                    AuditRecord::new(
                        AuditComponent::Dissemination,
                        [decision.decision_id.to_string()],
                        AuditOutcome::Blocked,
                        violation.to_string(),
                    )
                    .with_details(details),
                );
            }
        }
        result
    }
}

fn inspect(decision: &DisseminationDecision, recipient: &RecipientConfig) -> Result<(), ReleaseViolation> {
    if decision.recipient_id != recipient.recipient_id {
        return Err(ReleaseViolation::WrongRecipient {
            decision: decision.recipient_id.clone(),
            recipient: recipient.recipient_id.clone(),
        });
    }
    if decision.entities.is_empty() || decision.information_subset.is_empty() {
        return Err(ReleaseViolation::EmptyPayload);
    }
    let ids_match = decision.entities.len() == decision.information_subset.len()
        && decision
            .entities
            .iter()
            .zip(&decision.information_subset)
            .all(|(entity, id)| &entity.entity_id == id);
    if !ids_match {
        return Err(ReleaseViolation::SubsetMismatch);
    }
    if decision.is_deception != recipient.is_enemy()
        || (recipient.is_enemy() && !decision.requires_human_approval)
        || (!recipient.is_enemy() && !decision.decoy_ids.is_empty())
        || decision.decoy_ids.iter().any(|id| !decision.information_subset.contains(id))
    {
        return Err(ReleaseViolation::DeceptionMismatch);
    }
    let clearance = recipient.max_classification();
    for entity in &decision.entities {
        if !clearance_satisfies(clearance, entity.information_classification) {
            return Err(ReleaseViolation::AboveClearance {
                entity_id: entity.entity_id.clone(),
                classification: entity.information_classification,
                clearance,
            });
        }
        if recipient.is_enemy() {
            let leak = if !entity.source_sensors.is_empty() {
                Some("source_sensors")
            } else if entity.speed_kmh.is_some() || entity.heading.is_some() {
                Some("motion")
            } else if entity.location.alt.is_some() {
                Some("altitude")
            } else if !entity.history.is_empty() {
                Some("history")
            } else if !entity.contributions.is_empty() {
                Some("contributions")
            } else {
                None
            };
            if let Some(field) = leak {
                return Err(ReleaseViolation::EnemyChannelLeak {
                    entity_id: entity.entity_id.clone(),
                    field,
                });
            }
        }
    }
    Ok(())
}

/// Delivery priority: deception traffic is always treated as critical.
#[must_use]
pub const fn effective_criticality(decision: &DisseminationDecision) -> ThreatLevel {
    if decision.is_deception {
        ThreatLevel::Critical
    } else {
        decision.criticality
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::DisseminationConfig, engine::DisseminationEngine, recipient::RecipientSpec};
    use chrono::Utc;
    use tifda_cop::model::{CopSnapshot, EntityCop, Location};

    fn picture() -> CopSnapshot {
        let mut secret = EntityCop::new("s1", "tank", Location::new(39.5, -0.4), Utc::now(), 0.9);
        secret.information_classification = InformationClassification::Secret;
        secret.source_sensors = ["radar_01".to_string()].into_iter().collect();
        let mut open = EntityCop::new("u1", "truck", Location::new(39.4, -0.4), Utc::now(), 0.9);
        open.speed_kmh = Some(30.0);
        CopSnapshot {
            version: 3,
            taken_at: Utc::now(),
            entities: [secret, open].into_iter().map(|e| (e.entity_id.clone(), e)).collect(),
        }
    }

    fn resolved(id: &str, access: &str) -> (RecipientSpec, RecipientConfig) {
        let mut spec = RecipientSpec::new(id, access);
        spec.need_to_know_override = true;
        let config = spec.resolve().unwrap();
        (spec, config)
    }

    fn decide(spec: RecipientSpec) -> DisseminationDecision {
        DisseminationEngine::new(DisseminationConfig::default(), Telemetry::in_memory("d"))
            .decide(&picture(), &[], &[spec])
            .decisions
            .remove(0)
    }

    #[test]
    fn clean_decisions_pass() {
        let guard = ReleaseGuard::new(Telemetry::in_memory("guard"));
        let (spec, recipient) = resolved("alpha", "secret_access");
        assert_eq!(guard.check(&decide(spec), &recipient), Ok(()));
        let (spec, enemy) = resolved("red", "enemy_access");
        assert_eq!(guard.check(&decide(spec), &enemy), Ok(()));
    }

    #[test]
    fn tampered_payload_is_blocked_and_audited() {
        let guard = ReleaseGuard::new(Telemetry::in_memory("guard"));
        let (spec, recipient) = resolved("alpha", "secret_access");
        let mut decision = decide(spec);
        decision.entities[0].information_classification = InformationClassification::TopSecret;
        assert!(matches!(
            guard.check(&decision, &recipient),
            Err(ReleaseViolation::AboveClearance { .. })
        ));
        let blocked = guard
            .telemetry
            .audit_trail()
            .records()
            .into_iter()
            .filter(|r| r.outcome == AuditOutcome::Blocked)
            .count();
        assert_eq!(blocked, 1);
    }

    #[test]
    fn enemy_channel_rejects_detailed_fields() {
        let guard = ReleaseGuard::new(Telemetry::in_memory("guard"));
        let (spec, enemy) = resolved("red", "enemy_access");
        let mut decision = decide(spec);
        decision.entities[0].speed_kmh = Some(30.0);
        assert!(matches!(
            guard.check(&decision, &enemy),
            Err(ReleaseViolation::EnemyChannelLeak { field: "motion", .. })
        ));

        let mut decision = decide(resolved("red", "enemy_access").0);
        decision.requires_human_approval = false;
        assert_eq!(guard.check(&decision, &enemy), Err(ReleaseViolation::DeceptionMismatch));
    }

    #[test]
    fn decoys_are_only_released_to_the_enemy_channel() {
        let guard = ReleaseGuard::new(Telemetry::in_memory("guard"));
        let (spec, recipient) = resolved("alpha", "secret_access");
        let mut decision = decide(spec);
        decision.decoy_ids = vec![decision.information_subset[0].clone()];
        assert_eq!(guard.check(&decision, &recipient), Err(ReleaseViolation::DeceptionMismatch));

        let (spec, enemy) = resolved("red", "enemy_access");
        let mut decision = decide(spec);
        assert!(!decision.decoy_ids.is_empty());
        decision.decoy_ids.push("u9".into());
        assert_eq!(guard.check(&decision, &enemy), Err(ReleaseViolation::DeceptionMismatch));
    }

    #[test]
    fn empty_and_misrouted_payloads_are_blocked() {
        let guard = ReleaseGuard::new(Telemetry::in_memory("guard"));
        let (spec, recipient) = resolved("alpha", "secret_access");
        let (_, other) = resolved("bravo", "secret_access");
        let decision = decide(spec);
        assert!(matches!(
            guard.check(&decision, &other),
            Err(ReleaseViolation::WrongRecipient { .. })
        ));
        let mut empty = decision;
        empty.entities.clear();
        empty.information_subset.clear();
        assert_eq!(guard.check(&empty, &recipient), Err(ReleaseViolation::EmptyPayload));
    }
}
