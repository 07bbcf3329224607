use std::{fs, path::{Path, PathBuf}};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tifda_cop::{
    config::{FirewallConfig, FusionConfig, SensorDirectory, SensorRegistration},
    sync::SyncConfig,
};
use tifda_dissemination::{
    config::DisseminationConfig, delivery::DeliveryConfig, ConfigError, PolicyError, RecipientSpec,
};

/// Where logs, events, and audit records go.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetrySection {
    /// JSON-lines log file.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// JSON-lines event file; events stay in memory when unset.
    #[serde(default)]
    pub event_log: Option<PathBuf>,
    /// JSON-lines audit file; the trail stays in memory when unset.
    #[serde(default)]
    pub audit_path: Option<PathBuf>,
    /// Audit records kept in memory.
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
}

const fn default_audit_capacity() -> usize {
    4096
}

/// The whole runtime configuration, one TOML document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TifdaConfig {
    /// Input firewall.
    #[serde(default)]
    pub firewall: FirewallConfig,
    /// Sensor whitelist.
    #[serde(default)]
    pub sensors: Vec<SensorRegistration>,
    /// Correlation and merge tuning.
    #[serde(default)]
    pub fusion: FusionConfig,
    /// Decision engine thresholds.
    #[serde(default)]
    pub dissemination: DisseminationConfig,
    /// Raw recipient tables; each one is decoded on its own so a bad entry
    /// only disables that recipient.
    #[serde(default)]
    pub recipients: Vec<toml::Value>,
    /// Outbound retry and accounting.
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Visualization mirror follower.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Log, event, and audit sinks.
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

impl TifdaConfig {
    /// Reads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("loading configuration {}", path.display()))
    }

    /// Parses and validates a TOML document.
    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("invalid TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every section that can make the runtime misbehave.
    ///
    /// Recipients are not checked here; they fail individually.
    pub fn validate(&self) -> Result<()> {
        self.firewall.validate().context("[firewall]")?;
        self.fusion.validate().context("[fusion]")?;
        self.dissemination
            .validate()
            .map_err(|err| anyhow!(err))
            .context("[dissemination]")?;
        anyhow::ensure!(self.delivery.max_attempts >= 1, "[delivery] max_attempts must be at least 1");
        anyhow::ensure!(self.delivery.timeout_ms > 0, "[delivery] timeout_ms must be positive");
        anyhow::ensure!(self.sync.batch_size > 0, "[sync] batch_size must be positive");
        Ok(())
    }

    /// Sensor whitelist.
    #[must_use]
    pub fn sensor_directory(&self) -> SensorDirectory {
        SensorDirectory::new(self.sensors.iter().cloned())
    }

    /// Decodes every recipient table; malformed ones come back as errors.
    #[must_use]
    pub fn recipient_specs(&self) -> (Vec<RecipientSpec>, Vec<PolicyError>) {
        let mut specs = Vec::with_capacity(self.recipients.len());
        let mut errors = Vec::new();
        for (index, value) in self.recipients.iter().enumerate() {
            match value.clone().try_into::<RecipientSpec>() {
                Ok(spec) => specs.push(spec),
                Err(err) => {
                    let recipient_id = value
                        .get("recipient_id")
                        .and_then(toml::Value::as_str)
                        .map_or_else(|| format!("#{index}"), str::to_string);
                    errors.push(PolicyError::Recipient {
                        recipient_id,
                        error: ConfigError::Malformed(err.to_string()),
                    });
                }
            }
        }
        (specs, errors)
    }
}
