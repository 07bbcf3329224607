use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::{AuditComponent, AuditOutcome, AuditRecord};
use thiserror::Error;
use tifda_cop::{model::ThreatAssessment, telemetry::Telemetry};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::engine::DisseminationDecision;

/// Review queue failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReviewError {
    /// No item with that id.
    #[error("review item {0} not found")]
    NotFound(Uuid),
    /// Item already has a verdict.
    #[error("review item {0} already decided")]
    AlreadyDecided(Uuid),
}

/// What a reviewer is asked to approve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "item", rename_all = "snake_case")]
pub enum ReviewSubject {
    /// Threat assessment awaiting confirmation.
    Threat(ThreatAssessment),
    /// Outbound decision awaiting release.
    Dissemination(DisseminationDecision),
}

impl ReviewSubject {
    fn subject_id(&self) -> String {
        match self {
            Self::Threat(assessment) => assessment.assessment_id.clone(),
            Self::Dissemination(decision) => decision.decision_id.to_string(),
        }
    }

    /// Content identity: two subjects with the same key ask the reviewer the
    /// same question, whatever their ids and timestamps.
    #[must_use]
    pub fn content_key(&self) -> String {
        match self {
            Self::Threat(assessment) => format!(
                "threat/{}/{}/{:.3}/{}",
                assessment.threat_source_id,
                assessment.threat_level,
                assessment.confidence,
                assessment.affected_entities.join(",")
            ),
            Self::Dissemination(decision) => format!(
                "decision/{}/{}/{}",
                decision.recipient_id,
                decision.snapshot_version,
                decision.information_subset.join(",")
            ),
        }
    }
}

/// Reviewer verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Release / accept.
    Approve,
    /// Withhold, with a reason for the audit trail.
    Reject {
        /// Reviewer's reason.
        reason: String,
    },
}

/// Where an item stands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Waiting for a reviewer.
    Pending,
    /// Approved.
    Approved {
        /// Who approved it.
        reviewer: String,
    },
    /// Rejected.
    Rejected {
        /// Who rejected it.
        reviewer: String,
        /// Why.
        reason: String,
    },
}

impl ReviewStatus {
    /// Whether a verdict exists.
    #[must_use]
    pub const fn is_decided(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One queued item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewItem {
    /// Queue id.
    pub id: Uuid,
    /// Item under review.
    pub subject: ReviewSubject,
    /// Why review was required.
    pub reasons: Vec<String>,
    /// Current state.
    pub status: ReviewStatus,
    /// When it was queued.
    pub submitted_at: DateTime<Utc>,
    /// When the verdict was given.
    pub decided_at: Option<DateTime<Utc>>,
    /// Set once an approved decision has been handed to delivery.
    #[serde(default)]
    pub released: bool,
}

#[derive(Debug, Default)]
struct Ledger {
    items: IndexMap<Uuid, ReviewItem>,
    by_content: HashMap<String, Uuid>,
}

impl Ledger {
    /// Existing item asking the same question; a repeated threat refreshes its timestamp.
    fn existing(&mut self, subject: &ReviewSubject) -> Option<Uuid> {
        let id = *self.by_content.get(&subject.content_key())?;
        let item = self.items.get_mut(&id)?;
        if let (ReviewSubject::Threat(stored), ReviewSubject::Threat(fresh)) = (&mut item.subject, subject) {
            stored.timestamp = stored.timestamp.max(fresh.timestamp);
        }
        Some(id)
    }

    fn insert(&mut self, item: ReviewItem) {
        self.by_content.insert(item.subject.content_key(), item.id);
        self.items.insert(item.id, item);
    }
}

/// In-process human review queue.
///
/// Writes are visible to the next read on any clone; waiters are woken on
/// every verdict. A subject already on file is not queued twice.
#[derive(Debug, Clone)]
pub struct ReviewQueue {
    ledger: Arc<Mutex<Ledger>>,
    notify: Arc<Notify>,
    telemetry: Telemetry,
}

impl ReviewQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(telemetry: Telemetry) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger::default())),
            notify: Arc::new(Notify::new()),
            telemetry,
        }
    }

    /// Queues an item for a reviewer, or returns the id of the item already
    /// on file for the same content.
    pub fn submit(&self, subject: ReviewSubject, reasons: Vec<String>) -> Uuid {
        let id = Uuid::new_v4();
        let subject_id = subject.subject_id();
        {
            let mut ledger = self.ledger.lock();
            if let Some(existing) = ledger.existing(&subject) {
                return existing;
            }
            ledger.insert(ReviewItem {
                id,
                subject,
                reasons: reasons.clone(),
                status: ReviewStatus::Pending,
                submitted_at: Utc::now(),
                decided_at: None,
                released: false,
            });
        }
        let _ = self.telemetry.audit(
            AuditRecord::new(AuditComponent::Review, [subject_id], AuditOutcome::Flagged, "queued for review")
                .with_details(json!({ "review_id": id, "reasons": reasons })),
        );
        let _ = self
            .telemetry
            .event("dissemination.review.queued", json!({ "review_id": id }));
        self.notify.notify_waiters();
        id
    }

    /// Records an item that needs no human step (high-confidence assessments).
    pub fn record_approved(&self, subject: ReviewSubject, reviewer: &str) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let subject_id = subject.subject_id();
        {
            let mut ledger = self.ledger.lock();
            if let Some(existing) = ledger.existing(&subject) {
                return existing;
            }
            ledger.insert(ReviewItem {
                id,
                subject,
                reasons: Vec::new(),
                status: ReviewStatus::Approved {
                    reviewer: reviewer.to_string(),
                },
                submitted_at: now,
                decided_at: Some(now),
                released: false,
            });
        }
        let _ = self.telemetry.audit(AuditRecord::new(
            AuditComponent::Review,
            [subject_id],
            AuditOutcome::Accepted,
            format!("approved by {reviewer}"),
        ));
        self.notify.notify_waiters();
        id
    }

    /// Items still waiting, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<ReviewItem> {
        self.ledger
            .lock()
            .items
            .values()
            .filter(|item| !item.status.is_decided())
            .cloned()
            .collect()
    }

    /// Looks up an item.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<ReviewItem> {
        self.ledger.lock().items.get(&id).cloned()
    }

    /// Records a verdict and wakes waiters.
    pub fn decide(&self, id: Uuid, verdict: Verdict, reviewer: &str) -> Result<ReviewItem, ReviewError> {
        let item = {
            let mut ledger = self.ledger.lock();
            let item = ledger.items.get_mut(&id).ok_or(ReviewError::NotFound(id))?;
            if item.status.is_decided() {
                return Err(ReviewError::AlreadyDecided(id));
            }
            item.status = match &verdict {
                Verdict::Approve => ReviewStatus::Approved {
                    reviewer: reviewer.to_string(),
                },
                Verdict::Reject { reason } => ReviewStatus::Rejected {
                    reviewer: reviewer.to_string(),
                    reason: reason.clone(),
                },
            };
            item.decided_at = Some(Utc::now());
            item.clone()
        };
        let (outcome, reason) = match &verdict {
            Verdict::Approve => (AuditOutcome::Accepted, format!("approved by {reviewer}")),
            Verdict::Reject { reason } => (AuditOutcome::Withheld, format!("rejected by {reviewer}: {reason}")),
        };
        let _ = self.telemetry.audit(
            AuditRecord::new(AuditComponent::Review, [item.subject.subject_id()], outcome, reason)
                .with_details(json!({ "review_id": id })),
        );
        let _ = self
            .telemetry
            .event("dissemination.review.decided", json!({ "review_id": id, "verdict": verdict }));
        self.notify.notify_waiters();
        Ok(item)
    }

    /// Waits until the item has a verdict.
    pub async fn wait(&self, id: Uuid) -> Result<ReviewItem, ReviewError> {
        loop {
            let notified = self.notify.notified();
            let item = self.get(id).ok_or(ReviewError::NotFound(id))?;
            if item.status.is_decided() {
                return Ok(item);
            }
            notified.await;
        }
    }

    /// Latest approved assessment per threat source.
    #[must_use]
    pub fn approved_threats(&self) -> Vec<ThreatAssessment> {
        let ledger = self.ledger.lock();
        let mut latest: BTreeMap<&str, &ThreatAssessment> = BTreeMap::new();
        for item in ledger.items.values() {
            let (ReviewSubject::Threat(assessment), ReviewStatus::Approved { .. }) = (&item.subject, &item.status)
            else {
                continue;
            };
            let slot = latest
                .entry(assessment.threat_source_id.as_str())
                .or_insert(assessment);
            if assessment.timestamp >= slot.timestamp {
                *slot = assessment;
            }
        }
        latest.into_values().cloned().collect()
    }

    /// Approved decisions not yet handed to delivery; each is returned once.
    pub fn take_released(&self) -> Vec<DisseminationDecision> {
        let mut ledger = self.ledger.lock();
        ledger
            .items
            .values_mut()
            .filter(|item| !item.released && matches!(item.status, ReviewStatus::Approved { .. }))
            .filter_map(|item| match &item.subject {
                ReviewSubject::Dissemination(decision) => {
                    item.released = true;
                    Some(decision.clone())
                }
                ReviewSubject::Threat(_) => None,
            })
            .collect()
    }

    /// Number of items ever queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ledger.lock().items.len()
    }

    /// Whether nothing was ever queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ledger.lock().items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tifda_cop::model::ThreatLevel;

    fn assessment(source: &str, level: ThreatLevel, minutes_ago: i64) -> ThreatAssessment {
        ThreatAssessment {
            assessment_id: format!("{source}-{minutes_ago}"),
            threat_source_id: source.into(),
            threat_level: level,
            affected_entities: vec!["base_alpha".into()],
            distances_to_affected_km: BTreeMap::new(),
            reasoning: "test".into(),
            confidence: 0.4,
            timestamp: Utc::now() - chrono::Duration::minutes(minutes_ago),
        }
    }

    #[test]
    fn only_approved_threats_are_visible() {
        let queue = ReviewQueue::new(Telemetry::in_memory("review"));
        let pending = queue.submit(ReviewSubject::Threat(assessment("h1", ThreatLevel::High, 0)), vec!["low confidence".into()]);
        queue.record_approved(ReviewSubject::Threat(assessment("h2", ThreatLevel::Low, 0)), "auto");
        assert_eq!(queue.pending().len(), 1);
        assert_eq!(queue.approved_threats().len(), 1);

        queue.decide(pending, Verdict::Approve, "op1").unwrap();
        assert!(queue.pending().is_empty());
        assert_eq!(queue.approved_threats().len(), 2);
        assert_eq!(
            queue.decide(pending, Verdict::Approve, "op1"),
            Err(ReviewError::AlreadyDecided(pending))
        );
        let records = queue.telemetry.audit_trail().by_component(AuditComponent::Review);
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn newest_assessment_per_source_wins() {
        let queue = ReviewQueue::new(Telemetry::in_memory("review"));
        queue.record_approved(ReviewSubject::Threat(assessment("h1", ThreatLevel::Low, 10)), "auto");
        queue.record_approved(ReviewSubject::Threat(assessment("h1", ThreatLevel::Critical, 1)), "auto");
        let approved = queue.approved_threats();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].threat_level, ThreatLevel::Critical);
    }

    #[test]
    fn repeated_subjects_are_filed_once() {
        let queue = ReviewQueue::new(Telemetry::in_memory("review"));
        let mut first = assessment("h1", ThreatLevel::High, 5);
        first.assessment_id = "threat-a".into();
        let id = queue.submit(ReviewSubject::Threat(first), vec!["low confidence".into()]);
        for n in 0..3 {
            let mut again = assessment("h1", ThreatLevel::High, 0);
            again.assessment_id = format!("threat-{n}");
            assert_eq!(queue.submit(ReviewSubject::Threat(again), Vec::new()), id);
        }
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending().len(), 1);
        assert!(queue.get(id).unwrap().submitted_at <= Utc::now());

        let changed = assessment("h1", ThreatLevel::Critical, 0);
        assert_ne!(queue.submit(ReviewSubject::Threat(changed), Vec::new()), id);
        assert_eq!(queue.len(), 2);
        let queued = queue.telemetry.audit_trail().by_component(AuditComponent::Review);
        assert_eq!(queued.len(), 2);
    }

    #[test]
    fn rejection_is_final() {
        let queue = ReviewQueue::new(Telemetry::in_memory("review"));
        let id = queue.submit(ReviewSubject::Threat(assessment("h1", ThreatLevel::High, 0)), Vec::new());
        let item = queue
            .decide(id, Verdict::Reject { reason: "misidentified".into() }, "op1")
            .unwrap();
        assert!(matches!(item.status, ReviewStatus::Rejected { .. }));
        assert!(queue.approved_threats().is_empty());
        assert!(matches!(
            queue.decide(Uuid::new_v4(), Verdict::Approve, "op1"),
            Err(ReviewError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn waiters_wake_on_verdict() {
        let queue = ReviewQueue::new(Telemetry::in_memory("review"));
        let id = queue.submit(ReviewSubject::Threat(assessment("h1", ThreatLevel::High, 0)), Vec::new());
        let reviewer = queue.clone();
        let waiter = tokio::spawn(async move { reviewer.wait(id).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.decide(id, Verdict::Approve, "op1").unwrap();
        let item = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(item.status, ReviewStatus::Approved { .. }));
    }
}
