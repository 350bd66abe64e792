//! Typed configuration.
//!
//! Environment variables cover identity and secrets (loaded once at
//! startup, fail fast when required vars are missing); service tuning
//! lives in an optional TOML file. Sensitive values are wrapped in
//! secrecy::SecretString to prevent log leaks.

pub mod secrets;

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::db::queue::RetryPolicy;
use crate::engine::control::ControlConfig;
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

// ---------------------------------------------------------------------------
// Service tuning (TOML)
// ---------------------------------------------------------------------------

/// Worker-pool and retry tuning, loaded from a TOML file. Every field
/// has a default, so a missing file means defaults across the board.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Idle poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Per-job execution budget in milliseconds.
    pub execution_budget_ms: u64,
    /// Retry attempts before dead-lettering.
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff, in milliseconds.
    pub retry_base_delay_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 2_000,
            execution_budget_ms: 120_000,
            max_attempts: 3,
            retry_base_delay_ms: 30_000,
        }
    }
}

impl ServiceConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad service config {}: {e}", path.display())))
    }

    pub fn control_config(&self) -> ControlConfig {
        ControlConfig {
            workers: self.workers,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            execution_budget: Duration::from_millis(self.execution_budget_ms),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
            },
        }
    }
}
