use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HearthError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `HEARTH_PROFILE`. When set (e.g. `PROD`), every key
    /// is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("HEARTH_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            storage: StorageConfig::from_env_profiled(p),
            scheduler: SchedulerConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), HearthError> {
        if self.scheduler.tick_secs == 0 {
            return Err(HearthError::InvalidConfig {
                key: "HEARTH_TICK_SECS".into(),
                value: "0".into(),
            });
        }
        if self.storage.max_connections == 0 {
            return Err(HearthError::InvalidConfig {
                key: "HEARTH_DB_MAX_CONNECTIONS".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  storage:    db={}, max_connections={}",
            self.storage.database_path().display(),
            self.storage.max_connections
        );
        tracing::info!(
            "  scheduler:  tick={}s, shutdown_timeout={}s, history_limit={}",
            self.scheduler.tick_secs,
            self.scheduler.shutdown_timeout_secs,
            self.scheduler.history_limit
        );
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub db_file: String,
    pub max_connections: u32,
}

impl StorageConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            data_dir: PathBuf::from(profiled_env_or(p, "HEARTH_DATA_DIR", "data")),
            db_file: profiled_env_or(p, "HEARTH_DB_FILE", "scheduler.db"),
            max_connections: profiled_env_u32(p, "HEARTH_DB_MAX_CONNECTIONS", 4),
        }
    }

    /// Full path of the scheduler database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_file)
    }
}

// ── Scheduler ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between due-task scans.
    pub tick_secs: u64,
    /// Upper bound on the graceful shutdown drain.
    pub shutdown_timeout_secs: u64,
    /// Default number of execution records returned by history queries.
    pub history_limit: u32,
}

impl SchedulerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            tick_secs: profiled_env_u64(p, "HEARTH_TICK_SECS", 60),
            shutdown_timeout_secs: profiled_env_u64(p, "HEARTH_SHUTDOWN_TIMEOUT_SECS", 30),
            history_limit: profiled_env_u32(p, "HEARTH_HISTORY_LIMIT", 20),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
