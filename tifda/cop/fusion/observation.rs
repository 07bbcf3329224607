use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::model::{Contribution, EntityCop, InformationClassification, SensorType};

/// One validated sensor report, ready for fusion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    /// Reporting sensor.
    pub sensor_id: String,
    /// Family of the reporting sensor.
    pub sensor_type: SensorType,
    /// What the sensor said.
    pub report: Contribution,
}

impl Observation {
    /// Builds an observation from a gate-approved entity.
    #[must_use]
    pub fn from_entity(
        entity: &EntityCop,
        sensor_id: impl Into<String>,
        sensor_type: SensorType,
        classification: InformationClassification,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            sensor_type,
            report: Contribution {
                track_id: entity.entity_id.clone(),
                entity_type: entity.entity_type.clone(),
                location: entity.location,
                timestamp: entity.timestamp,
                iff: entity.classification,
                information_classification: classification,
                confidence: entity.confidence.clamp(0.0, 1.0),
                speed_kmh: entity.speed_kmh,
                heading: entity.heading,
                comments: entity.comments.clone(),
            },
        }
    }

    /// Sensitivity of a report: an explicit message override wins, otherwise the
    /// sensor default or the label the entity declared, whichever is higher.
    #[must_use]
    pub fn resolve_classification(
        explicit: Option<InformationClassification>,
        sensor_default: InformationClassification,
        declared: InformationClassification,
    ) -> InformationClassification {
        explicit.unwrap_or_else(|| sensor_default.max(declared))
    }

    /// Key under which a sensor's track is remembered.
    #[must_use]
    pub fn alias(&self) -> String {
        format!("{}/{}", self.sensor_id, self.report.track_id)
    }
}

/// Whether `candidate` replaces `current` as a sensor's latest report.
///
/// Newer timestamps win. Equal timestamps fall back to a total order over the
/// report contents so the outcome never depends on arrival order.
pub(crate) fn supersedes(candidate: &Contribution, current: &Contribution) -> bool {
    match candidate.timestamp.cmp(&current.timestamp) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => tiebreak(candidate, current) == Ordering::Greater,
    }
}

fn tiebreak(a: &Contribution, b: &Contribution) -> Ordering {
    let opt = |v: Option<f64>| v.unwrap_or(f64::NEG_INFINITY);
    a.confidence
        .total_cmp(&b.confidence)
        .then_with(|| a.location.lat.total_cmp(&b.location.lat))
        .then_with(|| a.location.lon.total_cmp(&b.location.lon))
        .then_with(|| opt(a.location.alt).total_cmp(&opt(b.location.alt)))
        .then_with(|| a.track_id.cmp(&b.track_id))
        .then_with(|| a.entity_type.cmp(&b.entity_type))
        .then_with(|| a.iff.as_str().cmp(b.iff.as_str()))
        .then_with(|| a.information_classification.cmp(&b.information_classification))
        .then_with(|| opt(a.speed_kmh).total_cmp(&opt(b.speed_kmh)))
        .then_with(|| opt(a.heading).total_cmp(&opt(b.heading)))
        .then_with(|| a.comments.cmp(&b.comments))
}
