//! Configuration loading: environment variables with sane defaults, or a
//! TOML file for full control. Every sub-config is validated before use.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::application::lifecycle::LifecycleConfig;
use crate::application::oco_validator::OcoValidatorConfig;
use crate::application::risk_control::RiskControlConfig;
use crate::domain::risk::correlation::CorrelationConfig;
use crate::domain::risk::sizing::SizingConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskGateConfig {
    pub risk_control: RiskControlConfig,
    pub sizing: SizingConfig,
    pub correlation: CorrelationConfig,
    pub lifecycle: LifecycleConfig,
    pub oco: OcoValidatorConfig,
    /// Backing file for the cross-platform position registry
    pub registry_path: PathBuf,
    /// Bounded wait for the registry's advisory lock
    pub registry_lock_timeout_ms: u64,
    /// Registry entries older than this are reaped
    pub registry_stale_hours: i64,
    /// Append-only OCO audit log
    pub audit_log_path: PathBuf,
}

impl Default for RiskGateConfig {
    fn default() -> Self {
        Self {
            risk_control: RiskControlConfig::default(),
            sizing: SizingConfig::default(),
            correlation: CorrelationConfig::default(),
            lifecycle: LifecycleConfig::default(),
            oco: OcoValidatorConfig::default(),
            registry_path: PathBuf::from("/tmp/riskgate_positions_registry.json"),
            registry_lock_timeout_ms: 5_000,
            registry_stale_hours: 24,
            audit_log_path: PathBuf::from("logs/oco_validation.jsonl"),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("Invalid value for {}: {}", key, raw)),
        Err(_) => Ok(default),
    }
}

impl RiskGateConfig {
    /// Build from environment variables (a `.env` file is honored when
    /// present). Only the commonly tuned knobs are exposed through the
    /// environment; use a TOML file for full control.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(path) = env::var("RISKGATE_REGISTRY_PATH") {
            config.registry_path = PathBuf::from(path);
        }
        if let Ok(path) = env::var("RISKGATE_AUDIT_LOG_PATH") {
            config.audit_log_path = PathBuf::from(path);
        }
        config.registry_lock_timeout_ms = env_parse(
            "RISKGATE_REGISTRY_LOCK_TIMEOUT_MS",
            config.registry_lock_timeout_ms,
        )?;
        config.registry_stale_hours =
            env_parse("RISKGATE_REGISTRY_STALE_HOURS", config.registry_stale_hours)?;
        config.lifecycle.max_concurrent =
            env_parse("RISKGATE_MAX_POSITIONS", config.lifecycle.max_concurrent)?;
        config.lifecycle.supervisor.tick_interval_ms = env_parse(
            "RISKGATE_TICK_INTERVAL_MS",
            config.lifecycle.supervisor.tick_interval_ms,
        )?;
        config.oco.interval_ms = env_parse("RISKGATE_OCO_INTERVAL_MS", config.oco.interval_ms)?;
        config.sizing.kelly_multiplier =
            env_parse("RISKGATE_KELLY_MULTIPLIER", config.sizing.kelly_multiplier)?;
        config.sizing.max_position_pct =
            env_parse("RISKGATE_MAX_POSITION_PCT", config.sizing.max_position_pct)?;
        config.correlation.block_threshold = env_parse(
            "RISKGATE_CORRELATION_BLOCK",
            config.correlation.block_threshold,
        )?;
        config.correlation.warn_threshold = env_parse(
            "RISKGATE_CORRELATION_WARN",
            config.correlation.warn_threshold,
        )?;

        config.validate()?;
        Ok(config)
    }

    /// Load a full configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.risk_control
            .validate()
            .map_err(|e| anyhow::anyhow!("risk_control: {}", e))?;
        self.sizing
            .validate()
            .map_err(|e| anyhow::anyhow!("sizing: {}", e))?;
        self.correlation
            .validate()
            .map_err(|e| anyhow::anyhow!("correlation: {}", e))?;
        self.lifecycle
            .validate()
            .map_err(|e| anyhow::anyhow!("lifecycle: {}", e))?;
        self.oco
            .validate()
            .map_err(|e| anyhow::anyhow!("oco: {}", e))?;
        if self.registry_lock_timeout_ms == 0 {
            anyhow::bail!("registry_lock_timeout_ms must be > 0");
        }
        if self.registry_stale_hours <= 0 {
            anyhow::bail!("registry_stale_hours must be > 0");
        }
        Ok(())
    }
}
