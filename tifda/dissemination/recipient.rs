use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    str::FromStr,
};

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tifda_cop::{
    geo::haversine_km,
    model::{InformationClassification, Location},
};

use crate::format::OutputFormat;

/// Why a recipient entry could not be used.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    /// Entry did not deserialize.
    #[error("malformed recipient entry: {0}")]
    Malformed(String),
    /// Empty `recipient_id`.
    #[error("recipient_id is empty")]
    MissingRecipientId,
    /// Access level string not recognised.
    #[error("unknown access level '{0}'")]
    UnknownAccessLevel(String),
    /// Area of responsibility is degenerate or out of range.
    #[error("invalid area of responsibility: {0}")]
    InvalidArea(String),
    /// Reference point outside valid coordinates.
    #[error("invalid reference point ({lat}, {lon})")]
    InvalidReferencePoint {
        /// Latitude given.
        lat: f64,
        /// Longitude given.
        lon: f64,
    },
    /// Negative or non-finite distance threshold.
    #[error("invalid distance threshold {0} km")]
    InvalidDistanceThreshold(f64),
    /// Output format not supported.
    #[error("unknown output format '{0}'")]
    UnknownFormat(String),
    /// HTTP transport without endpoint.
    #[error("http transport requires an endpoint")]
    MissingEndpoint,
    /// Same id configured twice.
    #[error("duplicate recipient id")]
    DuplicateRecipient,
}

/// Policy failure that skips one recipient or assessment and lets the rest proceed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PolicyError {
    /// Recipient configuration unusable.
    #[error("recipient '{recipient_id}' skipped: {error}")]
    Recipient {
        /// Offending recipient (or its position when the id is missing).
        recipient_id: String,
        /// Underlying problem.
        #[source]
        error: ConfigError,
    },
    /// Approved assessment whose source is not in the snapshot.
    #[error("assessment '{assessment_id}' references unknown entity '{entity_id}'")]
    UnknownThreatSource {
        /// Assessment id.
        assessment_id: String,
        /// Missing entity.
        entity_id: String,
    },
}

/// How much a recipient may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessLevel {
    /// Cleared up to and including the level.
    Cleared(InformationClassification),
    /// Adversarial channel; only deception traffic.
    Enemy,
}

impl AccessLevel {
    /// Most sensitive label the recipient may receive.
    #[must_use]
    pub const fn max_classification(self) -> InformationClassification {
        match self {
            Self::Cleared(level) => level,
            Self::Enemy => InformationClassification::Unclassified,
        }
    }

    /// Whether this is an adversarial channel.
    #[must_use]
    pub const fn is_enemy(self) -> bool {
        matches!(self, Self::Enemy)
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cleared(level) => write!(f, "{}_access", level.as_str().to_ascii_lowercase()),
            Self::Enemy => f.write_str("enemy_access"),
        }
    }
}

impl FromStr for AccessLevel {
    type Err = ConfigError;

    /// Accepts `secret_access`, `SECRET`, `top secret`, `enemy_access`, and similar.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        let level = normalized.strip_suffix("_access").unwrap_or(&normalized);
        if level == "enemy" {
            return Ok(Self::Enemy);
        }
        level
            .parse::<InformationClassification>()
            .map(Self::Cleared)
            .map_err(|_| ConfigError::UnknownAccessLevel(s.to_string()))
    }
}

impl Serialize for AccessLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Geographic region a recipient is responsible for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum AreaOfResponsibility {
    /// Latitude/longitude box; does not wrap the antimeridian.
    BoundingBox {
        /// Southern edge.
        min_lat: f64,
        /// Western edge.
        min_lon: f64,
        /// Northern edge.
        max_lat: f64,
        /// Eastern edge.
        max_lon: f64,
    },
    /// Circle around a point.
    Radius {
        /// Centre.
        center: Location,
        /// Radius, km.
        radius_km: f64,
    },
}

impl AreaOfResponsibility {
    /// Whether `location` lies inside (edges included).
    #[must_use]
    pub fn contains(&self, location: &Location) -> bool {
        match self {
            Self::BoundingBox {
                min_lat,
                min_lon,
                max_lat,
                max_lon,
            } => (*min_lat..=*max_lat).contains(&location.lat) && (*min_lon..=*max_lon).contains(&location.lon),
            Self::Radius { center, radius_km } => haversine_km(center, location) <= *radius_km,
        }
    }

    /// Centre point, used when a recipient has no reference point.
    #[must_use]
    pub fn centre(&self) -> Location {
        match self {
            Self::BoundingBox {
                min_lat,
                min_lon,
                max_lat,
                max_lon,
            } => Location::new((min_lat + max_lat) / 2.0, (min_lon + max_lon) / 2.0),
            Self::Radius { center, .. } => *center,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::BoundingBox {
                min_lat,
                min_lon,
                max_lat,
                max_lon,
            } => {
                let corners_valid = Location::new(*min_lat, *min_lon).is_valid()
                    && Location::new(*max_lat, *max_lon).is_valid();
                if !corners_valid {
                    return Err(ConfigError::InvalidArea("corner outside valid coordinates".into()));
                }
                if min_lat > max_lat || min_lon > max_lon {
                    return Err(ConfigError::InvalidArea("minimum exceeds maximum".into()));
                }
                Ok(())
            }
            Self::Radius { center, radius_km } => {
                if !center.is_valid() {
                    return Err(ConfigError::InvalidArea("centre outside valid coordinates".into()));
                }
                if !(radius_km.is_finite() && *radius_km > 0.0) {
                    return Err(ConfigError::InvalidArea(format!("radius {radius_km} km")));
                }
                Ok(())
            }
        }
    }
}

/// Outbound channel type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Event bus publish on the recipient topic.
    #[default]
    Broker,
    /// Point-to-point HTTP delivery.
    Http,
}

/// Outbound channel settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TransportSpec {
    /// Channel type.
    #[serde(default)]
    pub kind: TransportKind,
    /// Target URL for HTTP delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// A `[[recipients]]` entry exactly as configured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecipientSpec {
    /// Unique recipient id.
    #[serde(default)]
    pub recipient_id: String,
    /// Raw access level string.
    #[serde(default)]
    pub access_level: String,
    /// Area of responsibility.
    #[serde(default)]
    pub area: Option<AreaOfResponsibility>,
    /// Where the recipient is; distances are measured from here.
    #[serde(default)]
    pub reference_point: Option<Location>,
    /// Declared assets (entity ids, base names) threats may affect.
    #[serde(default)]
    pub assets: Vec<String>,
    /// Replaces the per-type distance bands for this recipient, km.
    #[serde(default)]
    pub distance_threshold_km: Option<f64>,
    /// Bypasses need-to-know (clearance still applies).
    #[serde(default)]
    pub need_to_know_override: bool,
    /// Wire format name.
    #[serde(default = "default_format")]
    pub format: String,
    /// Outbound channel.
    #[serde(default)]
    pub transport: TransportSpec,
}

fn default_format() -> String {
    OutputFormat::Json.as_str().to_string()
}

impl RecipientSpec {
    /// Entry with a clearance and defaults for everything else.
    #[must_use]
    pub fn new(recipient_id: impl Into<String>, access_level: impl Into<String>) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            access_level: access_level.into(),
            area: None,
            reference_point: None,
            assets: Vec::new(),
            distance_threshold_km: None,
            need_to_know_override: false,
            format: default_format(),
            transport: TransportSpec::default(),
        }
    }

    /// Validates the raw entry.
    pub fn resolve(&self) -> Result<RecipientConfig, ConfigError> {
        let recipient_id = self.recipient_id.trim();
        if recipient_id.is_empty() {
            return Err(ConfigError::MissingRecipientId);
        }
        let access_level: AccessLevel = self.access_level.parse()?;
        if let Some(area) = &self.area {
            area.validate()?;
        }
        if let Some(point) = self.reference_point {
            if !point.is_valid() {
                return Err(ConfigError::InvalidReferencePoint {
                    lat: point.lat,
                    lon: point.lon,
                });
            }
        }
        if let Some(threshold) = self.distance_threshold_km {
            if !(threshold.is_finite() && threshold >= 0.0) {
                return Err(ConfigError::InvalidDistanceThreshold(threshold));
            }
        }
        let format: OutputFormat = self.format.parse()?;
        if self.transport.kind == TransportKind::Http
            && self.transport.endpoint.as_deref().map_or(true, |e| e.trim().is_empty())
        {
            return Err(ConfigError::MissingEndpoint);
        }
        Ok(RecipientConfig {
            recipient_id: recipient_id.to_string(),
            access_level,
            area: self.area,
            reference_point: self.reference_point,
            assets: self.assets.iter().map(|a| a.trim().to_string()).collect(),
            distance_threshold_km: self.distance_threshold_km,
            need_to_know_override: self.need_to_know_override,
            format,
            transport: self.transport.clone(),
        })
    }
}

/// A validated recipient.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecipientConfig {
    /// Unique recipient id.
    pub recipient_id: String,
    /// Clearance.
    pub access_level: AccessLevel,
    /// Area of responsibility.
    pub area: Option<AreaOfResponsibility>,
    /// Explicit reference point.
    pub reference_point: Option<Location>,
    /// Declared assets.
    pub assets: BTreeSet<String>,
    /// Per-recipient distance threshold, km.
    pub distance_threshold_km: Option<f64>,
    /// Need-to-know bypass.
    pub need_to_know_override: bool,
    /// Wire format.
    pub format: OutputFormat,
    /// Outbound channel.
    pub transport: TransportSpec,
}

impl RecipientConfig {
    /// Most sensitive label this recipient may receive.
    #[must_use]
    pub const fn max_classification(&self) -> InformationClassification {
        self.access_level.max_classification()
    }

    /// Whether this is an adversarial channel.
    #[must_use]
    pub const fn is_enemy(&self) -> bool {
        self.access_level.is_enemy()
    }

    /// Point distances are measured from: the reference point, else the area centre.
    #[must_use]
    pub fn reference(&self) -> Option<Location> {
        self.reference_point
            .or_else(|| self.area.as_ref().map(AreaOfResponsibility::centre))
    }

    /// Whether a threat affecting `affected` concerns this recipient.
    #[must_use]
    pub fn concerned_by(&self, affected: &[String]) -> bool {
        affected
            .iter()
            .any(|asset| asset == &self.recipient_id || self.assets.contains(asset))
    }
}

/// Resolves every spec; bad entries become errors without affecting the others.
#[must_use]
pub fn resolve_all(specs: &[RecipientSpec]) -> (Vec<RecipientConfig>, Vec<PolicyError>) {
    let mut seen = HashSet::new();
    let mut resolved = Vec::new();
    let mut errors = Vec::new();
    for (index, spec) in specs.iter().enumerate() {
        let label = if spec.recipient_id.trim().is_empty() {
            format!("#{index}")
        } else {
            spec.recipient_id.trim().to_string()
        };
        let outcome = spec.resolve().and_then(|config| {
            if seen.insert(config.recipient_id.clone()) {
                Ok(config)
            } else {
                Err(ConfigError::DuplicateRecipient)
            }
        });
        match outcome {
            Ok(config) => resolved.push(config),
            Err(error) => errors.push(PolicyError::Recipient {
                recipient_id: label,
                error,
            }),
        }
    }
    (resolved, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_level_spellings() {
        let secret = AccessLevel::Cleared(InformationClassification::Secret);
        assert_eq!("secret_access".parse::<AccessLevel>().unwrap(), secret);
        assert_eq!("SECRET".parse::<AccessLevel>().unwrap(), secret);
        assert_eq!(
            "Top Secret".parse::<AccessLevel>().unwrap(),
            AccessLevel::Cleared(InformationClassification::TopSecret)
        );
        assert_eq!("enemy_access".parse::<AccessLevel>().unwrap(), AccessLevel::Enemy);
        assert!(matches!(
            "cosmic".parse::<AccessLevel>(),
            Err(ConfigError::UnknownAccessLevel(_))
        ));
        assert_eq!(secret.to_string(), "secret_access");
    }

    #[test]
    fn area_containment_and_centre() {
        let bbox = AreaOfResponsibility::BoundingBox {
            min_lat: 39.0,
            min_lon: -1.0,
            max_lat: 40.0,
            max_lon: 1.0,
        };
        assert!(bbox.contains(&Location::new(39.5, 0.0)));
        assert!(!bbox.contains(&Location::new(41.0, 0.0)));
        assert_eq!(bbox.centre(), Location::new(39.5, 0.0));

        let circle = AreaOfResponsibility::Radius {
            center: Location::new(39.5, 0.0),
            radius_km: 20.0,
        };
        assert!(circle.contains(&Location::new(39.6, 0.0)));
        assert!(!circle.contains(&Location::new(40.0, 0.0)));
    }

    #[test]
    fn malformed_entries_do_not_block_the_rest() {
        let mut http = RecipientSpec::new("hq", "top_secret_access");
        http.transport.kind = TransportKind::Http;
        let specs = vec![
            RecipientSpec::new("alpha", "secret_access"),
            RecipientSpec::new("", "secret_access"),
            RecipientSpec::new("bravo", "galactic"),
            http,
            RecipientSpec::new("alpha", "confidential_access"),
            RecipientSpec::new("enemy", "enemy_access"),
        ];
        let (resolved, errors) = resolve_all(&specs);
        let ids: Vec<_> = resolved.iter().map(|r| r.recipient_id.as_str()).collect();
        assert_eq!(ids, ["alpha", "enemy"]);
        assert_eq!(errors.len(), 4);
        assert!(errors.contains(&PolicyError::Recipient {
            recipient_id: "#1".into(),
            error: ConfigError::MissingRecipientId,
        }));
        assert!(errors.contains(&PolicyError::Recipient {
            recipient_id: "hq".into(),
            error: ConfigError::MissingEndpoint,
        }));
        assert!(errors.contains(&PolicyError::Recipient {
            recipient_id: "alpha".into(),
            error: ConfigError::DuplicateRecipient,
        }));
    }

    #[test]
    fn reference_falls_back_to_area_centre() {
        let mut spec = RecipientSpec::new("alpha", "secret");
        spec.area = Some(AreaOfResponsibility::BoundingBox {
            min_lat: 0.0,
            min_lon: 0.0,
            max_lat: 2.0,
            max_lon: 2.0,
        });
        let config = spec.resolve().unwrap();
        assert_eq!(config.reference(), Some(Location::new(1.0, 1.0)));
        assert!(!config.is_enemy());
    }

    #[test]
    fn decodes_from_toml() {
        let spec: RecipientSpec = toml::from_str(
            r#"
            recipient_id = "base_alpha"
            access_level = "secret_access"
            assets = ["base_alpha"]
            format = "cot"
            area = { shape = "radius", center = { lat = 39.5, lon = -0.4 }, radius_km = 50.0 }
            transport = { kind = "http", endpoint = "http://localhost:9000/inbox" }
            "#,
        )
        .unwrap();
        let config = spec.resolve().unwrap();
        assert_eq!(config.format, OutputFormat::Cot);
        assert_eq!(config.transport.kind, TransportKind::Http);
        assert!(config.area.is_some());
    }
}
