//! TOML configuration with defaults for every field.
//!
//! ```toml
//! [storage]
//! path = "data/dmvsentry.db"
//!
//! [target]
//! path = "data/stats-snapshot.db"
//!
//! [scheduler]
//! max_in_flight = 1
//!
//! [[scheduler.query]]
//! id = "top-io"
//! every_secs = 60
//! timeout_secs = 20
//!
//! [report]
//! threshold = 0.2
//! ```

use crate::error::SentryError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub storage: StorageConfig,
    pub target: TargetConfig,
    pub catalog: CatalogConfig,
    pub scheduler: SchedulerConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Result archive database.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/dmvsentry.db"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetConfig {
    pub kind: TargetKind,
    pub path: Option<PathBuf>,
    pub max_connections: u32,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            kind: TargetKind::Sqlite,
            path: None,
            max_connections: 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    /// Replaces the built-in catalog when set.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub max_in_flight: usize,
    pub tick_ms: u64,
    pub default_timeout_secs: u64,
    pub query: Vec<ScheduleEntry>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            tick_ms: 1000,
            default_timeout_secs: 30,
            query: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// Cadence for one catalog query. Exactly one of `every_secs` and `cron`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleEntry {
    pub id: String,
    #[serde(default)]
    pub every_secs: Option<u64>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportConfig {
    /// Relative worsening that flags a regression (0.2 = 20%).
    pub threshold: f64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self { threshold: 0.2 }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, SentryError> {
        let config: Config =
            toml::from_str(text).map_err(|e| SentryError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file; a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, SentryError> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let config = Self::from_toml(&text)?;
                info!(path=%path.display(), "Loaded configuration");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path=%path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(SentryError::Config(format!("cannot read {}: {}", path.display(), e))),
        }
    }

    pub fn validate(&self) -> Result<(), SentryError> {
        let s = &self.scheduler;
        if s.max_in_flight == 0 {
            return Err(SentryError::Config("scheduler.max_in_flight must be at least 1".into()));
        }
        if s.tick_ms == 0 {
            return Err(SentryError::Config("scheduler.tick_ms must be at least 1".into()));
        }
        if s.default_timeout_secs == 0 {
            return Err(SentryError::Config("scheduler.default_timeout_secs must be at least 1".into()));
        }
        if !self.report.threshold.is_finite() || self.report.threshold < 0.0 {
            return Err(SentryError::Config(format!(
                "report.threshold must be a non-negative number, got {}",
                self.report.threshold
            )));
        }
        for entry in &s.query {
            match (entry.every_secs, entry.cron.as_deref()) {
                (Some(0), None) => {
                    return Err(SentryError::Config(format!("'{}': every_secs must be at least 1", entry.id)))
                }
                (Some(_), None) | (None, Some(_)) => {}
                _ => {
                    return Err(SentryError::Config(format!(
                        "'{}': set exactly one of every_secs and cron",
                        entry.id
                    )))
                }
            }
            if entry.timeout_secs == Some(0) {
                return Err(SentryError::Config(format!("'{}': timeout_secs must be at least 1", entry.id)));
            }
        }
        Ok(())
    }
}
