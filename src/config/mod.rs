//! Configuration management for the collector
//!
//! Configuration is read from TOML. Every section is optional and falls back
//! to its defaults. Durations are written as strings such as `"500ms"`, `"5s"`,
//! `"15m"` or `"1h"`.

use crate::error::{CollectorError, Result};
use crate::store::SourceRef;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod validator;

pub use validator::ConfigValidator;

pub const SCHEMA_VERSION: &str = "1.0.0";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(rename = "_meta", default)]
    pub meta: MetaConfig,
    #[serde(default)]
    pub collector: SourceConfig,
    #[serde(default)]
    pub flows: FlowsConfig,
    #[serde(default)]
    pub pairs: PairsConfig,
    #[serde(default)]
    pub processes: ProcessesConfig,
    #[serde(default)]
    pub records: RecordsConfig,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            created_at: current_timestamp(),
        }
    }
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Identity the collector uses as the source of records it creates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub source_id: String,
    pub source_version: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            source_id: "self".to_string(),
            source_version: "0.1".to_string(),
        }
    }
}

impl SourceConfig {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef::new(&self.source_id, &self.source_version)
    }
}

/// Flow correlation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowsConfig {
    /// Reconcile pass interval right after new work arrived
    pub reconcile_min_interval: String,
    /// Longest wait between reconcile passes while idle
    pub reconcile_max_interval: String,
    /// How often cached connector and process attributes are dropped
    pub attribute_cache_ttl: String,
    pub purge_interval: String,
    /// Flows without updates for this long are purged
    pub idle_timeout: String,
    pub flow_source_interval: String,
    /// How long a flow may stay unresolved before its source host is registered
    pub flow_source_grace: String,
    /// Upper bound on tracked flows per cache, 0 for unbounded
    pub max_tracked_flows: usize,
}

impl Default for FlowsConfig {
    fn default() -> Self {
        Self {
            reconcile_min_interval: "500ms".to_string(),
            reconcile_max_interval: "5s".to_string(),
            attribute_cache_ttl: "30s".to_string(),
            purge_interval: "10s".to_string(),
            idle_timeout: "15m".to_string(),
            flow_source_interval: "5s".to_string(),
            flow_source_grace: "15s".to_string(),
            max_tracked_flows: 0,
        }
    }
}

impl FlowsConfig {
    pub fn reconcile_min_interval(&self) -> Duration {
        duration_or(&self.reconcile_min_interval, Duration::from_millis(500))
    }

    pub fn reconcile_max_interval(&self) -> Duration {
        duration_or(&self.reconcile_max_interval, Duration::from_secs(5))
    }

    pub fn attribute_cache_ttl(&self) -> Duration {
        duration_or(&self.attribute_cache_ttl, Duration::from_secs(30))
    }

    pub fn purge_interval(&self) -> Duration {
        duration_or(&self.purge_interval, Duration::from_secs(10))
    }

    pub fn idle_timeout(&self) -> Duration {
        duration_or(&self.idle_timeout, Duration::from_secs(15 * 60))
    }

    pub fn flow_source_interval(&self) -> Duration {
        duration_or(&self.flow_source_interval, Duration::from_secs(5))
    }

    pub fn flow_source_grace(&self) -> Duration {
        duration_or(&self.flow_source_grace, Duration::from_secs(15))
    }
}

/// Pair materialization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairsConfig {
    pub rescan_interval: String,
}

impl Default for PairsConfig {
    fn default() -> Self {
        Self {
            rescan_interval: "3s".to_string(),
        }
    }
}

impl PairsConfig {
    pub fn rescan_interval(&self) -> Duration {
        duration_or(&self.rescan_interval, Duration::from_secs(3))
    }
}

/// Synthetic process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessesConfig {
    pub rebuild_interval: String,
}

impl Default for ProcessesConfig {
    fn default() -> Self {
        Self {
            rebuild_interval: "60s".to_string(),
        }
    }
}

impl ProcessesConfig {
    pub fn rebuild_interval(&self) -> Duration {
        duration_or(&self.rebuild_interval, Duration::from_secs(60))
    }
}

/// Record housekeeping settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordsConfig {
    pub cleanup_interval: String,
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: "10s".to_string(),
        }
    }
}

impl RecordsConfig {
    pub fn cleanup_interval(&self) -> Duration {
        duration_or(&self.cleanup_interval, Duration::from_secs(10))
    }
}

/// Parse a duration string like `"250ms"`, `"5s"`, `"15m"` or `"1h"`
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let invalid = || CollectorError::Config(format!("Invalid duration: '{}'", s));

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(invalid());
    }
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    let seconds = |scale: u64| value.checked_mul(scale).map(Duration::from_secs);
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => seconds(60).ok_or_else(invalid),
        "h" => seconds(3600).ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

fn duration_or(s: &str, default: Duration) -> Duration {
    match parse_duration(s) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!("{}, using {:?}", e, default);
            default
        }
    }
}

impl CollectorConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CollectorError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| CollectorError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: CollectorConfig = toml::from_str(&content)?;

        // Apply environment variable overrides
        config.apply_env_overrides();

        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| CollectorError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: VANFLOW_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix("VANFLOW_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "COLLECTOR__SOURCE_ID" => self.collector.source_id = value.to_string(),
            "COLLECTOR__SOURCE_VERSION" => self.collector.source_version = value.to_string(),
            "FLOWS__RECONCILE_MIN_INTERVAL" => {
                self.flows.reconcile_min_interval = checked_duration(path, value)?
            }
            "FLOWS__RECONCILE_MAX_INTERVAL" => {
                self.flows.reconcile_max_interval = checked_duration(path, value)?
            }
            "FLOWS__ATTRIBUTE_CACHE_TTL" => {
                self.flows.attribute_cache_ttl = checked_duration(path, value)?
            }
            "FLOWS__PURGE_INTERVAL" => self.flows.purge_interval = checked_duration(path, value)?,
            "FLOWS__IDLE_TIMEOUT" => self.flows.idle_timeout = checked_duration(path, value)?,
            "FLOWS__FLOW_SOURCE_INTERVAL" => {
                self.flows.flow_source_interval = checked_duration(path, value)?
            }
            "FLOWS__FLOW_SOURCE_GRACE" => {
                self.flows.flow_source_grace = checked_duration(path, value)?
            }
            "FLOWS__MAX_TRACKED_FLOWS" => {
                self.flows.max_tracked_flows =
                    value
                        .parse()
                        .map_err(|_| CollectorError::InvalidConfigValue {
                            path: path.to_string(),
                            message: format!("Cannot parse '{}' as a count", value),
                        })?;
            }
            "PAIRS__RESCAN_INTERVAL" => self.pairs.rescan_interval = checked_duration(path, value)?,
            "PROCESSES__REBUILD_INTERVAL" => {
                self.processes.rebuild_interval = checked_duration(path, value)?
            }
            "RECORDS__CLEANUP_INTERVAL" => {
                self.records.cleanup_interval = checked_duration(path, value)?
            }
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| CollectorError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("vanflow-collector").join("config.toml"))
    }
}

fn checked_duration(path: &str, value: &str) -> Result<String> {
    parse_duration(value).map_err(|e| CollectorError::InvalidConfigValue {
        path: path.to_string(),
        message: e.to_string(),
    })?;
    Ok(value.to_string())
}
