//! Configuration management for the commit coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
    static ref PARTICIPANT_NAME: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").unwrap();
    static ref TABLE_NAME: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub coordinator: CoordinatorConfig,
    pub retry: RetryConfig,
    pub recovery: RecoveryConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub participants: HashMap<String, ParticipantConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    pub instance_id: String,
    /// Upper bound on a single prepare call; expiry counts as a `No` vote
    pub prepare_timeout_ms: u64,
    /// Default wait for `run` callers that do not pass their own timeout
    pub run_timeout_ms: u64,
    /// Re-reads allowed after a version conflict before giving up
    pub max_conflict_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub sweep_interval_secs: u64,
    /// Transactions untouched for this long are picked up by the periodic sweep
    pub stale_after_secs: u64,
    pub max_concurrent_recoveries: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub backend: LogBackend,
    #[serde(default)]
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantKind {
    /// PostgreSQL prepared transactions
    Postgres,
    /// In-process participant
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParticipantConfig {
    pub kind: ParticipantKind,
    pub url: Option<String>,
    pub table: Option<String>,
    #[serde(default = "default_participant_connections")]
    pub max_connections: u32,
    pub enabled: bool,
}

fn default_participant_connections() -> u32 {
    4
}

impl CoordinatorConfig {
    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            instance_id: "coordinator".to_string(),
            prepare_timeout_ms: 5_000,
            run_timeout_ms: 30_000,
            max_conflict_retries: 5,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            call_timeout_ms: 5_000,
        }
    }
}

impl RecoveryConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: 30,
            stale_after_secs: 60,
            max_concurrent_recoveries: 16,
        }
    }
}

impl Settings {
    /// Load settings from the file named by `COORDINATOR_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("COORDINATOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_participants().is_empty() {
            anyhow::bail!("At least one participant must be enabled");
        }

        if self.database.backend == LogBackend::Postgres && self.database.url.is_empty() {
            anyhow::bail!("The postgres transaction log needs database.url");
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }

        if self.recovery.enabled && self.recovery.sweep_interval_secs == 0 {
            anyhow::bail!("recovery.sweep_interval_secs must be at least 1");
        }

        if self.recovery.max_concurrent_recoveries == 0 {
            anyhow::bail!("recovery.max_concurrent_recoveries must be at least 1");
        }

        for (name, participant) in &self.participants {
            if !PARTICIPANT_NAME.is_match(name) {
                anyhow::bail!("Participant name {:?} may only use letters, digits, '-' and '_'", name);
            }

            if !participant.enabled || participant.kind != ParticipantKind::Postgres {
                continue;
            }

            match participant.url.as_deref() {
                Some(url) if !url.is_empty() => {}
                _ => anyhow::bail!("Participant {} has no database url configured", name),
            }

            match participant.table.as_deref() {
                Some(table) if TABLE_NAME.is_match(table) => {}
                Some(table) => anyhow::bail!("Participant {} has an invalid table name {:?}", name, table),
                None => anyhow::bail!("Participant {} has no table configured", name),
            }
        }

        if self.recovery.enabled && self.recovery.stale_after_secs == 0 {
            tracing::warn!("recovery.stale_after_secs is 0 - sweeps will race live transactions");
        }

        Ok(())
    }

    /// Get list of enabled participants, sorted by name
    pub fn enabled_participants(&self) -> Vec<(&String, &ParticipantConfig)> {
        let mut enabled: Vec<_> = self
            .participants
            .iter()
            .filter(|(_, p)| p.enabled)
            .collect();
        enabled.sort_by(|a, b| a.0.cmp(b.0));
        enabled
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
