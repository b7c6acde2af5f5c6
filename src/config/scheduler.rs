//! Scheduler, store backend and activity configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::{ActivitySettings, SchedulerOptions, DEFAULT_TASK_LIMIT};
use crate::core::AppResult;

/// Per-activity policy as written in configuration files.
pub type ActivityConfig = ActivitySettings;

/// Task store backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StoreBackendConfig {
    /// Volatile in-memory store for development/testing.
    #[default]
    InMemory,
    /// JSON-lines snapshot file.
    File {
        /// Snapshot path.
        path: PathBuf,
    },
    /// SQLite database file.
    Sqlite {
        /// Database path.
        path: PathBuf,
    },
}

impl StoreBackendConfig {
    /// Backend name as used by `TASK_STORE`.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InMemory => "in_memory",
            Self::File { .. } => "file",
            Self::Sqlite { .. } => "sqlite",
        }
    }
}

const fn default_task_limit() -> usize {
    DEFAULT_TASK_LIMIT
}

const fn default_cycle_interval_ms() -> u64 {
    5_000
}

const fn default_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

/// Root scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Slot budget of each pool.
    #[serde(default = "default_task_limit")]
    pub task_limit: usize,
    /// Timer period in milliseconds.
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
    /// FINISHED tasks older than this many seconds are purged.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Store backend.
    #[serde(default)]
    pub store: StoreBackendConfig,
    /// Activity code to policy.
    #[serde(default)]
    pub activities: HashMap<String, ActivityConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_limit: default_task_limit(),
            cycle_interval_ms: default_cycle_interval_ms(),
            retention_secs: default_retention_secs(),
            store: StoreBackendConfig::default(),
            activities: HashMap::new(),
        }
    }
}

impl SchedulerConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.task_limit == 0 {
            return Err("task_limit must be greater than 0".into());
        }
        if self.cycle_interval_ms == 0 {
            return Err("cycle_interval_ms must be greater than 0".into());
        }
        match &self.store {
            StoreBackendConfig::File { path } | StoreBackendConfig::Sqlite { path }
                if path.as_os_str().is_empty() =>
            {
                return Err(format!("store `{}` requires a path", self.store.kind()));
            }
            _ => {}
        }
        for (code, activity) in &self.activities {
            if code.trim().is_empty() {
                return Err("activity code must not be empty".into());
            }
            activity
                .validate()
                .map_err(|e| format!("activity `{code}` invalid: {e}"))?;
        }
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by the environment (and a `.env` file when present).
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `TASK_*` overrides read through `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        if let Some(v) = lookup("TASK_LIMIT") {
            self.task_limit = v.trim().parse().with_context(|| format!("TASK_LIMIT={v}"))?;
        }
        if let Some(v) = lookup("TASK_CYCLE_INTERVAL_MS") {
            self.cycle_interval_ms = v
                .trim()
                .parse()
                .with_context(|| format!("TASK_CYCLE_INTERVAL_MS={v}"))?;
        }
        if let Some(v) = lookup("TASK_RETENTION_SECS") {
            self.retention_secs = v
                .trim()
                .parse()
                .with_context(|| format!("TASK_RETENTION_SECS={v}"))?;
        }
        if let Some(kind) = lookup("TASK_STORE") {
            let path = lookup("TASK_STORE_PATH").map(PathBuf::from);
            self.store = match (kind.trim(), path) {
                ("in_memory" | "memory", _) => StoreBackendConfig::InMemory,
                ("file", Some(path)) => StoreBackendConfig::File { path },
                ("sqlite", Some(path)) => StoreBackendConfig::Sqlite { path },
                ("file" | "sqlite", None) => {
                    anyhow::bail!("TASK_STORE={kind} requires TASK_STORE_PATH")
                }
                (other, _) => anyhow::bail!("unknown TASK_STORE `{other}`"),
            };
        }
        self.validate().map_err(anyhow::Error::msg)?;
        Ok(self)
    }

    /// Runtime tunables derived from this configuration.
    pub const fn options(&self) -> SchedulerOptions {
        SchedulerOptions {
            task_limit: self.task_limit,
            cycle_interval: Duration::from_millis(self.cycle_interval_ms),
            retention: Duration::from_secs(self.retention_secs),
        }
    }
}
