//! Configuration loading and management.
//!
//! Loads engine configuration from `./turnstile.toml` (or
//! `$TURNSTILE_CONFIG_PATH`). Environment variables override file
//! values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TurnstileConfig {
    /// Engine behavior knobs (`[engine]`).
    pub engine: EngineConfig,
    /// Filesystem paths (`[paths]`).
    pub paths: PathsConfig,
    /// Logging settings (`[log]`).
    pub log: LogConfig,
}

/// Engine behavior knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How many times a rate-limited grant write is retried (after the
    /// signalled delay) before the task is abandoned.
    pub rate_limit_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_limit_attempts: 5,
        }
    }
}

/// Filesystem paths.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory for rotated JSON log files.
    pub logs_dir: String,
    /// Default policy file consumed by `simulate` and `check`.
    pub policy_file: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            logs_dir: "logs".to_owned(),
            policy_file: "policy.toml".to_owned(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default log filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

impl TurnstileConfig {
    /// Load configuration with precedence: env vars > TOML file >
    /// defaults.
    ///
    /// Config file path: `$TURNSTILE_CONFIG_PATH` or `./turnstile.toml`.
    /// A missing file is not an error; defaults apply.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or
    /// parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: TurnstileConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(TurnstileConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        match env("TURNSTILE_CONFIG_PATH") {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("turnstile.toml"),
        }
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("TURNSTILE_RATE_LIMIT_ATTEMPTS") {
            match v.parse() {
                Ok(n) => self.engine.rate_limit_attempts = n,
                Err(_) => tracing::warn!(
                    var = "TURNSTILE_RATE_LIMIT_ATTEMPTS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("TURNSTILE_LOGS_DIR") {
            self.paths.logs_dir = v;
        }
        if let Some(v) = env("TURNSTILE_POLICY_FILE") {
            self.paths.policy_file = v;
        }
        if let Some(v) = env("TURNSTILE_LOG_LEVEL") {
            self.log.level = v;
        }
    }
}
