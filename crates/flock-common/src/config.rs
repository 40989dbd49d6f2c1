//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Shared primitives and utilities for the driver runtime."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::ids::IdFormat;
use crate::logging::LogFormat;

fn default_allow_multiple_commands() -> bool {
    true
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_preferred_media() -> Vec<String> {
    vec!["wireless".to_owned()]
}

fn default_chunk_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_pending_buffers() -> usize {
    256
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

/// Primary configuration object for the driver runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub reassembly: ReassemblyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "FLOCK_CONFIG";

    /// Load configuration from disk, respecting the `FLOCK_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Read, parse and validate a single configuration file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.driver.validate()?;
        self.reassembly.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Settings consumed by the fleet driver core.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Template turning numeric vehicle indices into display ids.
    #[serde(default)]
    pub id_format: IdFormat,
    /// When `true`, a new command preempts the pending one for the same
    /// vehicle; when `false`, it is rejected until the first one finishes.
    #[serde(default = "default_allow_multiple_commands")]
    pub allow_multiple_commands_per_vehicle: bool,
    /// Upper bound applied by callers waiting on a command response.
    #[serde(default = "default_command_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub command_timeout: Duration,
    /// Media tried, in order, when picking an outbound address.
    #[serde(default = "default_preferred_media")]
    pub preferred_media: Vec<String>,
}

impl DriverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.preferred_media.is_empty() {
            return Err(anyhow!("driver.preferred_media must list at least one medium"));
        }
        if self.preferred_media.iter().any(|m| m.trim().is_empty()) {
            return Err(anyhow!("driver.preferred_media must not contain empty names"));
        }
        if self.command_timeout.is_zero() {
            return Err(anyhow!("driver.command_timeout must be positive"));
        }
        Ok(())
    }

    /// Whether a second command for a busy vehicle must be rejected.
    pub fn strict_commands(&self) -> bool {
        !self.allow_multiple_commands_per_vehicle
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            id_format: IdFormat::default(),
            allow_multiple_commands_per_vehicle: default_allow_multiple_commands(),
            command_timeout: default_command_timeout(),
            preferred_media: default_preferred_media(),
        }
    }
}

/// Bounds applied to partially received command responses.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassemblyConfig {
    #[serde(default = "default_chunk_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub chunk_timeout: Duration,
    #[serde(default = "default_max_pending_buffers")]
    pub max_pending_buffers: usize,
    /// Upper bound on a reassembled body after inflation.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl ReassemblyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_timeout.is_zero() {
            return Err(anyhow!("reassembly.chunk_timeout must be positive"));
        }
        if self.max_pending_buffers == 0 {
            return Err(anyhow!("reassembly.max_pending_buffers must be positive"));
        }
        if self.max_body_bytes == 0 {
            return Err(anyhow!("reassembly.max_body_bytes must be positive"));
        }
        Ok(())
    }
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            chunk_timeout: default_chunk_timeout(),
            max_pending_buffers: default_max_pending_buffers(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}
