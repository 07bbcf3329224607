use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Geographic position in WGS84 degrees with optional altitude in meters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Location {
    /// Latitude, degrees.
    pub lat: f64,
    /// Longitude, degrees.
    pub lon: f64,
    /// Altitude above mean sea level, meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
}

impl Location {
    /// Creates a sea-level location.
    #[must_use]
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon, alt: None }
    }

    /// Attaches an altitude.
    #[must_use]
    pub const fn with_alt(mut self, alt: f64) -> Self {
        self.alt = Some(alt);
        self
    }

    /// Whether latitude and longitude are finite and inside [-90,90] x [-180,180].
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
            && self.alt.map_or(true, f64::is_finite)
    }
}

/// Identification Friend-or-Foe label.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum IffClassification {
    /// Own or allied force.
    Friendly,
    /// Adversary.
    Hostile,
    /// Non-combatant.
    Neutral,
    /// Not yet identified.
    #[default]
    Unknown,
}

impl IffClassification {
    /// All labels, in wire order.
    pub const ALL: [Self; 4] = [Self::Friendly, Self::Hostile, Self::Neutral, Self::Unknown];

    /// Wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Friendly => "friendly",
            Self::Hostile => "hostile",
            Self::Neutral => "neutral",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the label carries an actual identification.
    #[must_use]
    pub const fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Two labels may describe the same object unless both are known and differ.
    #[must_use]
    pub fn compatible_with(self, other: Self) -> bool {
        !self.is_known() || !other.is_known() || self == other
    }
}

impl fmt::Display for IffClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for unrecognised label strings.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unrecognised {kind} value '{value}'")]
pub struct LabelParseError {
    /// Which label family failed.
    pub kind: &'static str,
    /// Offending input.
    pub value: String,
}

impl FromStr for IffClassification {
    type Err = LabelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|label| label.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| LabelParseError {
                kind: "iff classification",
                value: s.to_string(),
            })
    }
}

/// Security sensitivity label. Ordering follows sensitivity: `Unclassified < TopSecret`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InformationClassification {
    /// Publicly releasable.
    #[default]
    Unclassified,
    /// Limited distribution.
    Restricted,
    /// Confidential.
    Confidential,
    /// Secret.
    Secret,
    /// Top secret.
    TopSecret,
}

impl InformationClassification {
    /// Every level, most sensitive first.
    pub const DESCENDING: [Self; 5] = [
        Self::TopSecret,
        Self::Secret,
        Self::Confidential,
        Self::Restricted,
        Self::Unclassified,
    ];

    /// Position in the total order; lower means more sensitive.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::TopSecret => 0,
            Self::Secret => 1,
            Self::Confidential => 2,
            Self::Restricted => 3,
            Self::Unclassified => 4,
        }
    }

    /// Wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TopSecret => "TOP_SECRET",
            Self::Secret => "SECRET",
            Self::Confidential => "CONFIDENTIAL",
            Self::Restricted => "RESTRICTED",
            Self::Unclassified => "UNCLASSIFIED",
        }
    }
}

impl fmt::Display for InformationClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InformationClassification {
    type Err = LabelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        Self::DESCENDING
            .into_iter()
            .find(|level| level.as_str() == normalized)
            .ok_or_else(|| LabelParseError {
                kind: "information classification",
                value: s.to_string(),
            })
    }
}

/// Sensor families known to the parser registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    /// Radar (ASTERIX and similar).
    Radar,
    /// Unmanned aerial vehicle.
    Drone,
    /// Radio intercept / voice report.
    Radio,
    /// Operator-entered report.
    Manual,
    /// Any other feed.
    Other,
}

impl SensorType {
    /// All sensor families.
    pub const ALL: [Self; 5] = [Self::Radar, Self::Drone, Self::Radio, Self::Manual, Self::Other];

    /// Wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Radar => "radar",
            Self::Drone => "drone",
            Self::Radio => "radio",
            Self::Manual => "manual",
            Self::Other => "other",
        }
    }

    /// Sensitivity attached to reports from this family when nothing more specific applies.
    #[must_use]
    pub const fn default_classification(self) -> InformationClassification {
        match self {
            Self::Radar => InformationClassification::Secret,
            Self::Drone | Self::Radio => InformationClassification::Confidential,
            Self::Manual => InformationClassification::Restricted,
            Self::Other => InformationClassification::Unclassified,
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorType {
    type Err = LabelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| LabelParseError {
                kind: "sensor type",
                value: s.to_string(),
            })
    }
}

/// Physical domain an entity type lives in; drives correlation gates and notification bands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Aircraft, helicopters, drones, missiles.
    Air,
    /// Vehicles, troops, installations.
    Ground,
    /// Surface vessels.
    SeaSurface,
    /// Submarines.
    SeaSubsurface,
    /// Satellites.
    Space,
    /// Network actors.
    Cyber,
    /// Anything else.
    Other,
}

struct TypeFamily {
    dimension: Dimension,
    generic: &'static [&'static str],
    specific: &'static [&'static str],
}

const TAXONOMY: &[TypeFamily] = &[
    TypeFamily {
        dimension: Dimension::Air,
        generic: &["aircraft", "air_unknown"],
        specific: &[
            "fighter",
            "bomber",
            "transport",
            "helicopter",
            "uav",
            "drone",
            "missile",
        ],
    },
    TypeFamily {
        dimension: Dimension::Ground,
        generic: &["ground_vehicle", "ground_unknown"],
        specific: &[
            "tank",
            "apc",
            "artillery",
            "infantry",
            "person",
            "truck",
            "building",
            "base",
            "installation",
        ],
    },
    TypeFamily {
        dimension: Dimension::SeaSurface,
        generic: &["ship", "surface_unknown"],
        specific: &["destroyer", "frigate", "boat", "vessel", "carrier"],
    },
    TypeFamily {
        dimension: Dimension::SeaSubsurface,
        generic: &["subsurface_unknown"],
        specific: &["submarine", "torpedo"],
    },
    TypeFamily {
        dimension: Dimension::Space,
        generic: &["space_unknown"],
        specific: &["satellite"],
    },
    TypeFamily {
        dimension: Dimension::Cyber,
        generic: &["cyber_unknown"],
        specific: &["network_node"],
    },
];

const FULLY_GENERIC: &[&str] = &["", "unknown", "other", "contact", "track"];

fn family_of(entity_type: &str) -> Option<(&'static TypeFamily, bool)> {
    let key = entity_type.trim().to_ascii_lowercase();
    TAXONOMY.iter().find_map(|family| {
        if family.generic.contains(&key.as_str()) {
            Some((family, true))
        } else if family.specific.contains(&key.as_str()) {
            Some((family, false))
        } else {
            None
        }
    })
}

impl Dimension {
    /// Maps a free-form entity type to its domain.
    #[must_use]
    pub fn of(entity_type: &str) -> Self {
        family_of(entity_type).map_or(Self::Other, |(family, _)| family.dimension)
    }
}

/// Whether an entity type carries no identity beyond "something is there".
#[must_use]
pub fn is_generic_type(entity_type: &str) -> bool {
    FULLY_GENERIC.contains(&entity_type.trim().to_ascii_lowercase().as_str())
}

/// Whether two entity types may describe the same physical object.
///
/// Equal types always match and a fully generic type matches anything. Otherwise
/// both must share a dimension and at least one side must be that dimension's
/// generic type (`aircraft` vs `fighter`, `air_unknown` vs `uav`).
#[must_use]
pub fn types_compatible(a: &str, b: &str) -> bool {
    if a.trim().eq_ignore_ascii_case(b.trim()) || is_generic_type(a) || is_generic_type(b) {
        return true;
    }
    match (family_of(a), family_of(b)) {
        (Some((fa, ga)), Some((fb, gb))) => fa.dimension == fb.dimension && (ga || gb),
        _ => false,
    }
}

/// How much identity an entity type carries: 0 fully generic, 1 dimension-generic, 2 specific.
#[must_use]
pub fn type_specificity(entity_type: &str) -> u8 {
    if is_generic_type(entity_type) {
        0
    } else {
        match family_of(entity_type) {
            Some((_, true)) => 1,
            _ => 2,
        }
    }
}

/// One point of an entity's recent track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackPoint {
    /// When the position was observed.
    pub timestamp: DateTime<Utc>,
    /// Observed position.
    pub location: Location,
    /// Sensor that reported the point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<String>,
}

/// Latest report a single sensor contributed to a fused entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contribution {
    /// Track identifier the sensor used.
    pub track_id: String,
    /// Reported entity type.
    pub entity_type: String,
    /// Reported position.
    pub location: Location,
    /// Observation time.
    pub timestamp: DateTime<Utc>,
    /// Reported IFF label.
    pub iff: IffClassification,
    /// Resolved sensitivity of the report.
    pub information_classification: InformationClassification,
    /// Sensor confidence in [0, 1].
    pub confidence: f64,
    /// Reported speed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
    /// Reported heading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    /// Reported free text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
}

/// Canonical fused record of one tracked object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityCop {
    /// Stable unique key.
    pub entity_id: String,
    /// Free-form type label (aircraft, tank, ship, ...).
    pub entity_type: String,
    /// Fused position.
    pub location: Location,
    /// Time of the newest contributing observation.
    pub timestamp: DateTime<Utc>,
    /// IFF label.
    #[serde(default)]
    pub classification: IffClassification,
    /// Sensitivity label; never lowered by fusion.
    #[serde(default)]
    pub information_classification: InformationClassification,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Sensors that contributed.
    #[serde(default)]
    pub source_sensors: BTreeSet<String>,
    /// Speed, km/h.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
    /// Heading, degrees clockwise from north.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    /// Recent positions, oldest first.
    #[serde(default, skip_serializing_if = "VecDeque::is_empty")]
    pub history: VecDeque<TrackPoint>,
    /// Free-text remarks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    /// Sensors disagree on position or identity; a human should look.
    #[serde(default)]
    pub needs_review: bool,
    /// Latest report per contributing sensor.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contributions: BTreeMap<String, Contribution>,
}

impl EntityCop {
    /// Minimal entity for construction in code and tests.
    #[must_use]
    pub fn new(
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        location: Location,
        timestamp: DateTime<Utc>,
        confidence: f64,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            location,
            timestamp,
            classification: IffClassification::Unknown,
            information_classification: InformationClassification::Unclassified,
            confidence,
            source_sensors: BTreeSet::new(),
            speed_kmh: None,
            heading: None,
            history: VecDeque::new(),
            comments: None,
            needs_review: false,
            contributions: BTreeMap::new(),
        }
    }

    /// Domain of the entity type.
    #[must_use]
    pub fn dimension(&self) -> Dimension {
        Dimension::of(&self.entity_type)
    }
}

/// Raw message as delivered by a sensor, before parsing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorMessage {
    /// Registered sensor identifier.
    pub sensor_id: String,
    /// Claimed sensor family.
    pub sensor_type: SensorType,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Format-specific body.
    pub payload: serde_json::Value,
    /// Explicit sensitivity for every entity in this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification_override: Option<InformationClassification>,
}

impl SensorMessage {
    /// Creates a message without an override.
    #[must_use]
    pub fn new(
        sensor_id: impl Into<String>,
        sensor_type: SensorType,
        timestamp: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            sensor_type,
            timestamp,
            payload,
            classification_override: None,
        }
    }
}

/// Threat severity.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    /// Minimal.
    #[default]
    Low,
    /// Elevated.
    Medium,
    /// Serious.
    High,
    /// Immediate.
    Critical,
}

impl ThreatLevel {
    /// Wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the threat evaluator; dissemination only consumes approved ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreatAssessment {
    /// Assessment identifier.
    pub assessment_id: String,
    /// Entity posing the threat.
    pub threat_source_id: String,
    /// Severity.
    pub threat_level: ThreatLevel,
    /// Identifiers of assets put at risk (recipient assets such as `base_alpha`).
    #[serde(default)]
    pub affected_entities: Vec<String>,
    /// Distances from the threat to each affected asset, km.
    #[serde(default)]
    pub distances_to_affected_km: BTreeMap<String, f64>,
    /// Human-readable reasoning.
    #[serde(default)]
    pub reasoning: String,
    /// Evaluator confidence in [0, 1].
    pub confidence: f64,
    /// When the assessment was produced.
    pub timestamp: DateTime<Utc>,
}

/// Immutable point-in-time view of the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CopSnapshot {
    /// Monotonic store version; bumps on every committed change.
    pub version: u64,
    /// When the snapshot was published.
    pub taken_at: DateTime<Utc>,
    /// Entities keyed by id.
    pub entities: BTreeMap<String, EntityCop>,
}

impl CopSnapshot {
    /// Empty snapshot at version zero.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: 0,
            taken_at: Utc::now(),
            entities: BTreeMap::new(),
        }
    }

    /// Looks up an entity.
    #[must_use]
    pub fn get(&self, entity_id: &str) -> Option<&EntityCop> {
        self.entities.get(entity_id)
    }

    /// Number of entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the picture is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_order_and_rank_agree() {
        assert!(InformationClassification::TopSecret > InformationClassification::Secret);
        assert_eq!(InformationClassification::TopSecret.rank(), 0);
        assert_eq!(InformationClassification::Unclassified.rank(), 4);
        assert_eq!(
            "top secret".parse::<InformationClassification>().unwrap(),
            InformationClassification::TopSecret
        );
        assert!("COSMIC".parse::<InformationClassification>().is_err());
    }

    #[test]
    fn serde_uses_wire_labels() {
        let json = serde_json::to_string(&InformationClassification::TopSecret).unwrap();
        assert_eq!(json, "\"TOP_SECRET\"");
        let iff: IffClassification = serde_json::from_str("\"hostile\"").unwrap();
        assert_eq!(iff, IffClassification::Hostile);
    }

    #[test]
    fn type_taxonomy() {
        assert!(types_compatible("aircraft", "fighter"));
        assert!(types_compatible("air_unknown", "uav"));
        assert!(types_compatible("unknown", "ship"));
        assert!(!types_compatible("fighter", "helicopter"));
        assert!(!types_compatible("tank", "ship"));
        assert!(!types_compatible("widget", "gadget"));
        assert_eq!(Dimension::of("Submarine"), Dimension::SeaSubsurface);
        assert!(type_specificity("fighter") > type_specificity("aircraft"));
        assert!(type_specificity("aircraft") > type_specificity("unknown"));
    }

    #[test]
    fn iff_compatibility() {
        assert!(IffClassification::Unknown.compatible_with(IffClassification::Hostile));
        assert!(!IffClassification::Friendly.compatible_with(IffClassification::Hostile));
    }
}
