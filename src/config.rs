//! Configuration loading and management.
//!
//! Loads latchkey configuration from `./latchkey.toml` (or
//! `$LATCHKEY_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::Deserialize;

use crate::coordinator::CoordinatorSettings;

// ── Top-level config ────────────────────────────────────────────

/// Top-level latchkey configuration loaded from TOML.
///
/// All sections use `#[serde(default)]` so a minimal or empty config file is
/// valid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LatchkeyConfig {
    /// Gateway listener settings.
    pub service: ServiceConfig,
    /// Filesystem paths for persistent state.
    pub paths: PathsConfig,
    /// Decision-policy parameters.
    pub policy: PolicyConfig,
}

/// Gateway listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Address the WebSocket gateway binds.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Log filter applied when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
        }
    }
}

/// Filesystem paths for persistent state.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Directory for rotated JSON log files.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            logs_dir: default_logs_dir(),
        }
    }
}

/// Decision-policy parameters.
///
/// These are process-wide: every device shares the same thresholds and
/// windows.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Minimum cosine similarity for a positive recognition.
    #[serde(default = "default_accept_threshold")]
    pub accept_threshold: f32,

    /// Similarity at or above which a new face enrollment is rejected as a
    /// duplicate. Lower than the acceptance threshold.
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f32,

    /// Seconds both factors must land within for an AND-policy grant.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Seconds to suppress repeat face-triggered grant attempts.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Seconds an armed enrollment stays live before it expires.
    #[serde(default = "default_enroll_ttl_secs")]
    pub enroll_ttl_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            accept_threshold: default_accept_threshold(),
            dedup_threshold: default_dedup_threshold(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
            enroll_ttl_secs: default_enroll_ttl_secs(),
        }
    }
}

impl PolicyConfig {
    /// Convert to the coordinator's runtime settings.
    pub fn settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            accept_threshold: self.accept_threshold,
            dedup_threshold: self.dedup_threshold,
            window: duration_secs(self.window_secs),
            cooldown: duration_secs(self.cooldown_secs),
            enroll_ttl: duration_secs(self.enroll_ttl_secs),
        }
    }
}

fn duration_secs(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

fn default_listen_addr() -> String {
    "0.0.0.0:8081".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_db_path() -> String {
    "latchkey.db".to_owned()
}

fn default_logs_dir() -> String {
    "logs".to_owned()
}

fn default_accept_threshold() -> f32 {
    0.9
}

fn default_dedup_threshold() -> f32 {
    0.8
}

fn default_window_secs() -> u64 {
    10
}

fn default_cooldown_secs() -> u64 {
    5
}

fn default_enroll_ttl_secs() -> u64 {
    120
}

impl LatchkeyConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$LATCHKEY_CONFIG_PATH` or `./latchkey.toml`.
    /// If the file does not exist, returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: LatchkeyConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(LatchkeyConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = env("LATCHKEY_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("latchkey.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids unsafe `set_var` in
    /// tests).
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("LATCHKEY_LISTEN_ADDR") {
            self.service.listen_addr = v;
        }
        if let Some(v) = env("LATCHKEY_LOG_LEVEL") {
            self.service.log_level = v;
        }
        if let Some(v) = env("LATCHKEY_DB_PATH") {
            self.paths.db_path = v;
        }
        if let Some(v) = env("LATCHKEY_LOGS_DIR") {
            self.paths.logs_dir = v;
        }

        override_parsed(&env, "LATCHKEY_ACCEPT_THRESHOLD", &mut self.policy.accept_threshold);
        override_parsed(&env, "LATCHKEY_DEDUP_THRESHOLD", &mut self.policy.dedup_threshold);
        override_parsed(&env, "LATCHKEY_WINDOW_SECS", &mut self.policy.window_secs);
        override_parsed(&env, "LATCHKEY_COOLDOWN_SECS", &mut self.policy.cooldown_secs);
        override_parsed(&env, "LATCHKEY_ENROLL_TTL_SECS", &mut self.policy.enroll_ttl_secs);
    }
}

/// Parse an env override into its target, warning (and keeping the previous
/// value) when the variable is set but unparseable.
fn override_parsed<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(v) = env(key) {
        match v.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!(var = key, value = %v, "ignoring invalid env override"),
        }
    }
}
