use serde::{Deserialize, Serialize};

use crate::need_to_know::DistanceBands;

/// `[dissemination]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisseminationConfig {
    /// Notification bands for threat-linked entities.
    #[serde(default)]
    pub bands: DistanceBands,
    /// Decoys mixed into every adversarial decision.
    #[serde(default = "default_decoys_per_decision")]
    pub decoys_per_decision: usize,
    /// Base seed for decoy generation.
    #[serde(default = "default_decoy_seed")]
    pub decoy_seed: u64,
    /// Assessments below this confidence wait for a reviewer.
    #[serde(default = "default_min_threat_confidence")]
    pub min_threat_confidence: f64,
    /// Budget for a single evaluator call, milliseconds.
    #[serde(default = "default_threat_timeout_ms")]
    pub threat_timeout_ms: u64,
    /// Friendly entities closer than this to a threat count as affected, km.
    #[serde(default = "default_affected_radius_km")]
    pub affected_radius_km: f64,
}

impl Default for DisseminationConfig {
    fn default() -> Self {
        Self {
            bands: DistanceBands::default(),
            decoys_per_decision: default_decoys_per_decision(),
            decoy_seed: default_decoy_seed(),
            min_threat_confidence: default_min_threat_confidence(),
            threat_timeout_ms: default_threat_timeout_ms(),
            affected_radius_km: default_affected_radius_km(),
        }
    }
}

impl DisseminationConfig {
    /// Rejects values the engine cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.min_threat_confidence) {
            return Err(format!(
                "min_threat_confidence {} outside [0, 1]",
                self.min_threat_confidence
            ));
        }
        if !(self.affected_radius_km.is_finite() && self.affected_radius_km > 0.0) {
            return Err(format!("affected_radius_km {} must be positive", self.affected_radius_km));
        }
        self.bands.validate()
    }
}

const fn default_decoys_per_decision() -> usize {
    3
}

const fn default_decoy_seed() -> u64 {
    0x71fd_a5ee_d000_0001
}

const fn default_min_threat_confidence() -> f64 {
    0.6
}

const fn default_threat_timeout_ms() -> u64 {
    2_000
}

const fn default_affected_radius_km() -> f64 {
    100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let config: DisseminationConfig = toml::from_str("decoys_per_decision = 5").unwrap();
        assert_eq!(config.decoys_per_decision, 5);
        assert!((config.min_threat_confidence - 0.6).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let config = DisseminationConfig {
            min_threat_confidence: 1.5,
            ..DisseminationConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
