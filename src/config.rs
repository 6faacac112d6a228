use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::MetricKind;
use crate::error::{SamplerError, SamplerResult};

pub const MIN_SAMPLE_INTERVAL_MS: u64 = 100;
pub const MAX_SAMPLE_INTERVAL_MS: u64 = 60_000;
pub const MIN_HISTORY_POINTS: usize = 10;
pub const MAX_HISTORY_POINTS: usize = 10_000;

/// Sampler settings
///
/// The serialized shape (camelCase field names and bounds) is the contract
/// shared with anything persisting or editing settings externally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplerSettings {
    pub sample_interval_ms: u64,
    pub enable_cpu: bool,
    pub enable_memory: bool,
    pub enable_disk: bool,
    pub enable_network: bool,
    pub enable_processes: bool,
    pub max_history_points: usize,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1000,
            enable_cpu: true,
            enable_memory: true,
            enable_disk: true,
            enable_network: true,
            enable_processes: true,
            max_history_points: 300,
        }
    }
}

impl SamplerSettings {
    /// Check bounds. Used both for settings loaded from a file and for every
    /// update applied to a running sampler.
    pub fn validate(&self) -> SamplerResult<()> {
        if !(MIN_SAMPLE_INTERVAL_MS..=MAX_SAMPLE_INTERVAL_MS).contains(&self.sample_interval_ms) {
            return Err(SamplerError::InvalidSettings(format!(
                "sampleIntervalMs must be within [{MIN_SAMPLE_INTERVAL_MS}, {MAX_SAMPLE_INTERVAL_MS}], got {}",
                self.sample_interval_ms
            )));
        }

        if !(MIN_HISTORY_POINTS..=MAX_HISTORY_POINTS).contains(&self.max_history_points) {
            return Err(SamplerError::InvalidSettings(format!(
                "maxHistoryPoints must be within [{MIN_HISTORY_POINTS}, {MAX_HISTORY_POINTS}], got {}",
                self.max_history_points
            )));
        }

        Ok(())
    }

    /// Merge a patch into a copy of these settings and validate the result.
    ///
    /// `self` is never modified, so a rejected patch leaves the caller's
    /// settings exactly as they were.
    pub fn merged(&self, patch: &SettingsPatch) -> SamplerResult<SamplerSettings> {
        let merged = SamplerSettings {
            sample_interval_ms: patch.sample_interval_ms.unwrap_or(self.sample_interval_ms),
            enable_cpu: patch.enable_cpu.unwrap_or(self.enable_cpu),
            enable_memory: patch.enable_memory.unwrap_or(self.enable_memory),
            enable_disk: patch.enable_disk.unwrap_or(self.enable_disk),
            enable_network: patch.enable_network.unwrap_or(self.enable_network),
            enable_processes: patch.enable_processes.unwrap_or(self.enable_processes),
            max_history_points: patch.max_history_points.unwrap_or(self.max_history_points),
        };
        merged.validate()?;
        Ok(merged)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn is_enabled(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Cpu => self.enable_cpu,
            MetricKind::Memory => self.enable_memory,
            MetricKind::Disk => self.enable_disk,
            MetricKind::Network => self.enable_network,
            MetricKind::Processes => self.enable_processes,
        }
    }
}

/// Partial settings update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsPatch {
    pub sample_interval_ms: Option<u64>,
    pub enable_cpu: Option<bool>,
    pub enable_memory: Option<bool>,
    pub enable_disk: Option<bool>,
    pub enable_network: Option<bool>,
    pub enable_processes: Option<bool>,
    pub max_history_points: Option<usize>,
}

impl SettingsPatch {
    pub fn interval(ms: u64) -> Self {
        Self {
            sample_interval_ms: Some(ms),
            ..Default::default()
        }
    }

    pub fn history(points: usize) -> Self {
        Self {
            max_history_points: Some(points),
            ..Default::default()
        }
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        /// Retention period in days (rows older than this are pruned)
        #[serde(default = "default_retention_days")]
        retention_days: u32,

        /// How often the retention cleanup runs
        #[serde(default = "default_cleanup_interval_hours")]
        cleanup_interval_hours: u32,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
            retention_days: default_retention_days(),
            cleanup_interval_hours: default_cleanup_interval_hours(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    crate::util::get_db_path().unwrap_or_else(|| PathBuf::from("./telemetry.db"))
}

fn default_retention_days() -> u32 {
    7
}

fn default_cleanup_interval_hours() -> u32 {
    24
}

fn default_source_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    #[serde(default = "crate::util::get_host_id")]
    pub host_id: String,

    #[serde(default)]
    pub sampler: SamplerSettings,

    /// Upper bound for a single source call before it counts as failed
    #[serde(default = "default_source_timeout_ms")]
    pub source_timeout_ms: u64,

    /// Storage configuration (defaults to SQLite)
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_id: crate::util::get_host_id(),
            sampler: SamplerSettings::default(),
            source_timeout_ms: default_source_timeout_ms(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms.max(1))
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))?;

    config.sampler.validate()?;
    trace!("loaded config: {config:?}");

    Ok(config)
}
