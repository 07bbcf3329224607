use std::collections::BTreeMap;

use anyhow::{bail, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::model::{Dimension, InformationClassification, SensorType};

/// Input firewall settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// How far in the future a message timestamp may lie, seconds.
    #[serde(default = "default_skew")]
    pub skew_tolerance_secs: i64,
    /// Lowest plausible altitude, meters.
    #[serde(default = "default_min_altitude")]
    pub min_altitude_m: f64,
    /// Highest plausible altitude, meters.
    #[serde(default = "default_max_altitude")]
    pub max_altitude_m: f64,
    /// Highest plausible speed, km/h.
    #[serde(default = "default_max_speed")]
    pub max_speed_kmh: f64,
    /// Reject on injection findings; when false findings are only audited.
    #[serde(default = "default_true")]
    pub strict: bool,
    /// Additional case-insensitive injection patterns.
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            skew_tolerance_secs: default_skew(),
            min_altitude_m: default_min_altitude(),
            max_altitude_m: default_max_altitude(),
            max_speed_kmh: default_max_speed(),
            strict: true,
            extra_patterns: Vec::new(),
        }
    }
}

impl FirewallConfig {
    /// Rejects inconsistent bounds.
    pub fn validate(&self) -> Result<()> {
        if self.skew_tolerance_secs < 0 {
            bail!("firewall.skew_tolerance_secs must be >= 0");
        }
        if self.min_altitude_m >= self.max_altitude_m {
            bail!("firewall altitude envelope is empty");
        }
        if self.max_speed_kmh <= 0.0 {
            bail!("firewall.max_speed_kmh must be positive");
        }
        Ok(())
    }
}

/// One whitelisted sensor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SensorRegistration {
    /// Identifier the sensor stamps on its messages.
    pub sensor_id: String,
    /// Registered family.
    pub sensor_type: SensorType,
    /// Disabled sensors are refused like unknown ones.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the family default sensitivity.
    #[serde(default)]
    pub default_classification: Option<InformationClassification>,
}

impl SensorRegistration {
    /// Enabled registration with the family default sensitivity.
    #[must_use]
    pub fn new(sensor_id: impl Into<String>, sensor_type: SensorType) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            sensor_type,
            enabled: true,
            default_classification: None,
        }
    }

    /// Sensitivity applied to reports without an explicit override.
    #[must_use]
    pub fn classification(&self) -> InformationClassification {
        self.default_classification
            .unwrap_or_else(|| self.sensor_type.default_classification())
    }
}

/// Whitelist of known sensors, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct SensorDirectory {
    sensors: IndexMap<String, SensorRegistration>,
}

impl SensorDirectory {
    /// Builds the directory; later duplicates replace earlier ones.
    #[must_use]
    pub fn new(registrations: impl IntoIterator<Item = SensorRegistration>) -> Self {
        let sensors = registrations
            .into_iter()
            .map(|reg| (reg.sensor_id.clone(), reg))
            .collect();
        Self { sensors }
    }

    /// Adds or replaces a registration.
    pub fn register(&mut self, registration: SensorRegistration) {
        self.sensors
            .insert(registration.sensor_id.clone(), registration);
    }

    /// Looks up a sensor.
    #[must_use]
    pub fn get(&self, sensor_id: &str) -> Option<&SensorRegistration> {
        self.sensors.get(sensor_id)
    }

    /// Registered sensors.
    pub fn iter(&self) -> impl Iterator<Item = &SensorRegistration> {
        self.sensors.values()
    }

    /// Number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    /// Whether no sensor is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

/// Correlation gates and fusion tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Correlation radius for air tracks, meters.
    #[serde(default = "default_air_gate")]
    pub air_gate_m: f64,
    /// Correlation radius for ground tracks, meters.
    #[serde(default = "default_ground_gate")]
    pub ground_gate_m: f64,
    /// Correlation radius for surface and subsurface tracks, meters.
    #[serde(default = "default_sea_gate")]
    pub sea_gate_m: f64,
    /// Correlation radius for everything else, meters.
    #[serde(default = "default_other_gate")]
    pub other_gate_m: f64,
    /// Observations older than this relative to the newest one no longer correlate or vote.
    #[serde(default = "default_staleness")]
    pub staleness_secs: i64,
    /// Spread between sensor positions that counts as a conflict; defaults to half the gate.
    #[serde(default)]
    pub divergence_m: Option<f64>,
    /// Maximum history points kept per entity.
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    /// Share of the independent-sensor boost applied to fused confidence, in [0, 1].
    #[serde(default = "default_gain")]
    pub corroboration_gain: f64,
    /// Per-type gate overrides, meters.
    #[serde(default)]
    pub type_gates_m: BTreeMap<String, f64>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            air_gate_m: default_air_gate(),
            ground_gate_m: default_ground_gate(),
            sea_gate_m: default_sea_gate(),
            other_gate_m: default_other_gate(),
            staleness_secs: default_staleness(),
            divergence_m: None,
            history_len: default_history_len(),
            corroboration_gain: default_gain(),
            type_gates_m: BTreeMap::new(),
        }
    }
}

impl FusionConfig {
    /// Correlation radius for an entity type.
    #[must_use]
    pub fn gate_for(&self, entity_type: &str) -> f64 {
        if let Some(gate) = self.type_gates_m.get(&entity_type.to_ascii_lowercase()) {
            return *gate;
        }
        match Dimension::of(entity_type) {
            Dimension::Air | Dimension::Space => self.air_gate_m,
            Dimension::Ground => self.ground_gate_m,
            Dimension::SeaSurface | Dimension::SeaSubsurface => self.sea_gate_m,
            Dimension::Cyber | Dimension::Other => self.other_gate_m,
        }
    }

    /// Position spread treated as sensor disagreement for an entity type.
    #[must_use]
    pub fn divergence_for(&self, entity_type: &str) -> f64 {
        self.divergence_m
            .unwrap_or_else(|| self.gate_for(entity_type) * 0.5)
    }

    /// Rejects unusable tuning.
    pub fn validate(&self) -> Result<()> {
        let gates = [
            self.air_gate_m,
            self.ground_gate_m,
            self.sea_gate_m,
            self.other_gate_m,
        ];
        if gates
            .iter()
            .chain(self.type_gates_m.values())
            .any(|gate| !gate.is_finite() || *gate <= 0.0)
        {
            bail!("fusion gates must be positive");
        }
        if self.staleness_secs <= 0 {
            bail!("fusion.staleness_secs must be positive");
        }
        if self.history_len == 0 {
            bail!("fusion.history_len must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.corroboration_gain) {
            bail!("fusion.corroboration_gain must lie in [0, 1]");
        }
        if self.divergence_m.is_some_and(|d| !d.is_finite() || d <= 0.0) {
            bail!("fusion.divergence_m must be positive");
        }
        Ok(())
    }
}

const fn default_true() -> bool {
    true
}

const fn default_skew() -> i64 {
    5
}

const fn default_min_altitude() -> f64 {
    -500.0
}

const fn default_max_altitude() -> f64 {
    30_000.0
}

const fn default_max_speed() -> f64 {
    5_000.0
}

const fn default_air_gate() -> f64 {
    5_000.0
}

const fn default_ground_gate() -> f64 {
    500.0
}

const fn default_sea_gate() -> f64 {
    2_000.0
}

const fn default_other_gate() -> f64 {
    500.0
}

const fn default_staleness() -> i64 {
    300
}

const fn default_history_len() -> usize {
    16
}

const fn default_gain() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let fusion: FusionConfig = toml::from_str("").unwrap();
        assert_eq!(fusion.gate_for("fighter"), 5_000.0);
        assert_eq!(fusion.gate_for("tank"), 500.0);
        assert_eq!(fusion.gate_for("frigate"), 2_000.0);
        assert_eq!(fusion.divergence_for("fighter"), 2_500.0);
        fusion.validate().unwrap();
        let firewall: FirewallConfig = toml::from_str("strict = false").unwrap();
        assert_eq!(firewall.skew_tolerance_secs, 5);
        assert!(!firewall.strict);
    }

    #[test]
    fn registration_prefers_explicit_default() {
        let mut radio = SensorRegistration::new("radio_02", SensorType::Radio);
        assert_eq!(radio.classification(), InformationClassification::Confidential);
        radio.default_classification = Some(InformationClassification::Secret);
        assert_eq!(radio.classification(), InformationClassification::Secret);
    }

    #[test]
    fn invalid_tuning_is_rejected() {
        let fusion = FusionConfig {
            history_len: 0,
            ..FusionConfig::default()
        };
        assert!(fusion.validate().is_err());
    }
}
