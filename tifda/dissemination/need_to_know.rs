use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tifda_cop::{
    geo::haversine_km,
    model::{Dimension, EntityCop, ThreatAssessment, ThreatLevel},
};

use crate::recipient::RecipientConfig;

/// Distance thresholds for one entity type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DistanceBand {
    /// Closer than this: always notify, km.
    pub must_notify_km: f64,
    /// Farther than this: never notify, km.
    pub never_notify_km: f64,
}

impl DistanceBand {
    /// Creates a band.
    #[must_use]
    pub const fn new(must_notify_km: f64, never_notify_km: f64) -> Self {
        Self {
            must_notify_km,
            never_notify_km,
        }
    }

    /// Places a distance in the band.
    #[must_use]
    pub fn classify(&self, distance_km: f64) -> DistanceVerdict {
        if distance_km < self.must_notify_km {
            DistanceVerdict::MustNotify
        } else if distance_km > self.never_notify_km {
            DistanceVerdict::NeverNotify
        } else {
            DistanceVerdict::Ambiguous
        }
    }
}

/// Outcome of the distance gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DistanceVerdict {
    /// Inside the mandatory radius.
    MustNotify,
    /// Between the two thresholds; a person decides.
    Ambiguous,
    /// Too far to matter.
    NeverNotify,
}

/// Band lookup: exact entity type, then dimension, then the default band.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistanceBands {
    /// Fallback band.
    #[serde(default = "default_band")]
    pub default: DistanceBand,
    /// Bands per physical dimension.
    #[serde(default = "default_dimension_bands")]
    pub dimensions: IndexMap<Dimension, DistanceBand>,
    /// Bands per exact entity type.
    #[serde(default = "default_type_bands")]
    pub types: IndexMap<String, DistanceBand>,
}

impl Default for DistanceBands {
    fn default() -> Self {
        Self {
            default: default_band(),
            dimensions: default_dimension_bands(),
            types: default_type_bands(),
        }
    }
}

impl DistanceBands {
    /// Band for an entity type.
    #[must_use]
    pub fn band_for(&self, entity_type: &str) -> DistanceBand {
        let key = entity_type.trim().to_ascii_lowercase();
        self.types
            .get(&key)
            .or_else(|| self.dimensions.get(&Dimension::of(&key)))
            .copied()
            .unwrap_or(self.default)
    }

    /// Every band must be finite with `must_notify_km <= never_notify_km`.
    pub fn validate(&self) -> Result<(), String> {
        let named = std::iter::once(("default".to_string(), &self.default))
            .chain(self.dimensions.iter().map(|(d, b)| (format!("{d:?}"), b)))
            .chain(self.types.iter().map(|(t, b)| (t.clone(), b)));
        for (name, band) in named {
            let finite = band.must_notify_km.is_finite() && band.never_notify_km.is_finite();
            if !finite || band.must_notify_km < 0.0 || band.must_notify_km > band.never_notify_km {
                return Err(format!("distance band '{name}' is inconsistent"));
            }
        }
        Ok(())
    }
}

const fn default_band() -> DistanceBand {
    DistanceBand::new(20.0, 100.0)
}

fn default_dimension_bands() -> IndexMap<Dimension, DistanceBand> {
    IndexMap::from([
        (Dimension::Air, DistanceBand::new(50.0, 200.0)),
        (Dimension::Ground, DistanceBand::new(10.0, 50.0)),
        (Dimension::SeaSurface, DistanceBand::new(30.0, 150.0)),
        (Dimension::SeaSubsurface, DistanceBand::new(30.0, 150.0)),
    ])
}

fn default_type_bands() -> IndexMap<String, DistanceBand> {
    IndexMap::from([
        ("missile".to_string(), DistanceBand::new(100.0, 500.0)),
        ("artillery".to_string(), DistanceBand::new(30.0, 80.0)),
    ])
}

/// Why an entity is relevant to a recipient.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "basis", rename_all = "snake_case")]
pub enum RelevanceBasis {
    /// Recipient bypasses need-to-know.
    Override,
    /// Entity lies inside the area of responsibility.
    AreaOfResponsibility,
    /// Entity is the source of an approved threat against the recipient's assets.
    ThreatLink {
        /// Assessment that created the link.
        assessment_id: String,
        /// Its severity.
        threat_level: ThreatLevel,
        /// Distance-gate outcome.
        verdict: DistanceVerdict,
        /// Distance from the recipient reference point, km.
        #[serde(skip_serializing_if = "Option::is_none")]
        distance_km: Option<f64>,
    },
}

/// A keep decision from the need-to-know rules.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Relevance {
    /// Rule that matched.
    #[serde(flatten)]
    pub basis: RelevanceBasis,
    /// Whether a person must confirm the release.
    pub ambiguous: bool,
}

impl Relevance {
    const fn certain(basis: RelevanceBasis) -> Self {
        Self {
            basis,
            ambiguous: false,
        }
    }

    /// Severity of the linked threat, if any.
    #[must_use]
    pub const fn threat_level(&self) -> Option<ThreatLevel> {
        match &self.basis {
            RelevanceBasis::ThreatLink { threat_level, .. } => Some(*threat_level),
            _ => None,
        }
    }
}

/// Approved assessments grouped by threat source.
#[derive(Debug, Default)]
pub struct ThreatIndex<'a> {
    by_source: HashMap<&'a str, Vec<&'a ThreatAssessment>>,
}

impl<'a> ThreatIndex<'a> {
    /// Indexes approved assessments.
    pub fn new(assessments: impl IntoIterator<Item = &'a ThreatAssessment>) -> Self {
        let mut by_source: HashMap<&str, Vec<&ThreatAssessment>> = HashMap::new();
        for assessment in assessments {
            by_source
                .entry(assessment.threat_source_id.as_str())
                .or_default()
                .push(assessment);
        }
        Self { by_source }
    }

    /// Most severe assessment of `entity_id` that concerns `recipient`.
    #[must_use]
    pub fn linked(&self, entity_id: &str, recipient: &RecipientConfig) -> Option<&'a ThreatAssessment> {
        self.by_source
            .get(entity_id)?
            .iter()
            .copied()
            .filter(|assessment| recipient.concerned_by(&assessment.affected_entities))
            .max_by(|a, b| {
                a.threat_level
                    .cmp(&b.threat_level)
                    .then_with(|| a.confidence.total_cmp(&b.confidence))
                    .then_with(|| b.assessment_id.cmp(&a.assessment_id))
            })
    }

    /// Every indexed source id.
    pub fn sources(&self) -> impl Iterator<Item = &&'a str> {
        self.by_source.keys()
    }
}

/// Need-to-know and distance rules for one entity and one recipient.
///
/// The override flag keeps everything. Otherwise an entity inside the area of
/// responsibility is kept outright; an entity outside it is kept only when an
/// approved threat links it to the recipient, subject to the distance gate. A
/// per-recipient `distance_threshold_km` replaces the band. Without a
/// reference point the distance cannot be judged and the keep is ambiguous.
#[must_use]
pub fn assess(
    entity: &EntityCop,
    recipient: &RecipientConfig,
    threats: &ThreatIndex<'_>,
    bands: &DistanceBands,
) -> Option<Relevance> {
    if recipient.need_to_know_override {
        return Some(Relevance::certain(RelevanceBasis::Override));
    }
    if recipient
        .area
        .as_ref()
        .is_some_and(|area| area.contains(&entity.location))
    {
        return Some(Relevance::certain(RelevanceBasis::AreaOfResponsibility));
    }
    let assessment = threats.linked(&entity.entity_id, recipient)?;
    let Some(reference) = recipient.reference() else {
        return Some(Relevance {
            basis: RelevanceBasis::ThreatLink {
                assessment_id: assessment.assessment_id.clone(),
                threat_level: assessment.threat_level,
                verdict: DistanceVerdict::Ambiguous,
                distance_km: None,
            },
            ambiguous: true,
        });
    };
    let distance_km = haversine_km(&reference, &entity.location);
    let verdict = match recipient.distance_threshold_km {
        Some(threshold) if distance_km <= threshold => DistanceVerdict::MustNotify,
        Some(_) => DistanceVerdict::NeverNotify,
        None => bands.band_for(&entity.entity_type).classify(distance_km),
    };
    if verdict == DistanceVerdict::NeverNotify {
        return None;
    }
    Some(Relevance {
        basis: RelevanceBasis::ThreatLink {
            assessment_id: assessment.assessment_id.clone(),
            threat_level: assessment.threat_level,
            verdict,
            distance_km: Some(distance_km),
        },
        ambiguous: verdict == DistanceVerdict::Ambiguous,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipient::{AreaOfResponsibility, RecipientSpec};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tifda_cop::model::Location;

    fn threat(source: &str, affected: &[&str], level: ThreatLevel) -> ThreatAssessment {
        ThreatAssessment {
            assessment_id: format!("a-{source}-{level}"),
            threat_source_id: source.into(),
            threat_level: level,
            affected_entities: affected.iter().map(|s| (*s).to_string()).collect(),
            distances_to_affected_km: BTreeMap::new(),
            reasoning: String::new(),
            confidence: 0.9,
            timestamp: Utc::now(),
        }
    }

    fn base_alpha() -> RecipientConfig {
        let mut spec = RecipientSpec::new("base_alpha", "secret_access");
        spec.reference_point = Some(Location::new(39.5, -0.4));
        spec.assets = vec!["base_alpha".into(), "convoy_7".into()];
        spec.area = Some(AreaOfResponsibility::Radius {
            center: Location::new(39.5, -0.4),
            radius_km: 10.0,
        });
        spec.resolve().unwrap()
    }

    fn hostile(id: &str, entity_type: &str, lat: f64) -> EntityCop {
        EntityCop::new(id, entity_type, Location::new(lat, -0.4), Utc::now(), 0.9)
    }

    #[test]
    fn bands_resolve_type_then_dimension_then_default() {
        let bands = DistanceBands::default();
        assert_eq!(bands.band_for("missile"), DistanceBand::new(100.0, 500.0));
        assert_eq!(bands.band_for("Fighter"), DistanceBand::new(50.0, 200.0));
        assert_eq!(bands.band_for("tank"), DistanceBand::new(10.0, 50.0));
        assert_eq!(bands.band_for("balloon"), DistanceBand::new(20.0, 100.0));
        assert!(bands.validate().is_ok());
    }

    #[test]
    fn area_membership_is_enough() {
        let entity = hostile("t1", "tank", 39.55);
        let relevance = assess(&entity, &base_alpha(), &ThreatIndex::default(), &DistanceBands::default());
        assert_eq!(relevance.unwrap().basis, RelevanceBasis::AreaOfResponsibility);
    }

    #[test]
    fn unrelated_entities_outside_area_are_dropped() {
        let entity = hostile("t1", "tank", 40.5);
        assert!(assess(&entity, &base_alpha(), &ThreatIndex::default(), &DistanceBands::default()).is_none());
    }

    #[test]
    fn threat_links_go_through_distance_bands() {
        let recipient = base_alpha();
        let bands = DistanceBands::default();
        let threats = [
            threat("near", &["convoy_7"], ThreatLevel::High),
            threat("mid", &["base_alpha"], ThreatLevel::Medium),
            threat("far", &["base_alpha"], ThreatLevel::Critical),
            threat("other", &["base_bravo"], ThreatLevel::Critical),
        ];
        let index = ThreatIndex::new(&threats);

        // ~0.2 degrees of latitude is ~22 km; ~1 degree is ~111 km; ~3 degrees ~333 km.
        let near = assess(&hostile("near", "fighter", 39.7), &recipient, &index, &bands).unwrap();
        assert!(!near.ambiguous);
        assert_eq!(near.threat_level(), Some(ThreatLevel::High));

        let mid = assess(&hostile("mid", "fighter", 40.5), &recipient, &index, &bands).unwrap();
        assert!(mid.ambiguous);

        assert!(assess(&hostile("far", "fighter", 42.5), &recipient, &index, &bands).is_none());
        assert!(assess(&hostile("other", "fighter", 39.7), &recipient, &index, &bands).is_none());
    }

    #[test]
    fn recipient_threshold_replaces_bands() {
        let mut recipient = base_alpha();
        recipient.distance_threshold_km = Some(150.0);
        let threats = [threat("mid", &["base_alpha"], ThreatLevel::Medium)];
        let index = ThreatIndex::new(&threats);
        let kept = assess(&hostile("mid", "fighter", 40.5), &recipient, &index, &DistanceBands::default()).unwrap();
        assert!(!kept.ambiguous);
        recipient.distance_threshold_km = Some(50.0);
        assert!(assess(&hostile("mid", "fighter", 40.5), &recipient, &index, &DistanceBands::default()).is_none());
    }

    #[test]
    fn missing_reference_point_is_ambiguous() {
        let recipient = RecipientSpec {
            assets: vec!["hq".into()],
            ..RecipientSpec::new("hq", "top_secret")
        }
        .resolve()
        .unwrap();
        let threats = [threat("x", &["hq"], ThreatLevel::Low)];
        let relevance = assess(
            &hostile("x", "tank", 10.0),
            &recipient,
            &ThreatIndex::new(&threats),
            &DistanceBands::default(),
        )
        .unwrap();
        assert!(relevance.ambiguous);
    }

    #[test]
    fn override_keeps_everything() {
        let mut recipient = base_alpha();
        recipient.need_to_know_override = true;
        let relevance = assess(&hostile("x", "tank", 60.0), &recipient, &ThreatIndex::default(), &DistanceBands::default());
        assert_eq!(relevance.unwrap().basis, RelevanceBasis::Override);
    }
}
