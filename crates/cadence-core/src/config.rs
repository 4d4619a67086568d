//! Cadence configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CadenceError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

fn default_database_path() -> String { "~/.cadence/cadence.db".into() }

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            scheduler: SchedulerConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl CadenceConfig {
    /// Load config from the default path (~/.cadence/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default().with_env_overrides())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CadenceError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CadenceError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config.with_env_overrides())
    }

    /// Save config to the given path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CadenceError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Cadence home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cadence")
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("CADENCE_WEBHOOK_URL")
            && !url.is_empty()
        {
            self.notify.webhook_url = Some(url);
        }
        self
    }
}

/// Periodic scan, materialization and dispatch tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between reminder scans.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// How far ahead occurrences are materialized.
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u32,
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_dispatches")]
    pub max_concurrent_dispatches: usize,
    /// Failed sends per (rule, occurrence, recipient) before escalation.
    #[serde(default = "default_max_dispatch_attempts")]
    pub max_dispatch_attempts: u32,
    /// Occurrences that started this long ago are still scanned if not yet ended.
    #[serde(default = "default_reminder_lookback_hours")]
    pub reminder_lookback_hours: u32,
    #[serde(default = "default_max_edit_retries")]
    pub max_edit_retries: u32,
}

fn default_scan_interval_secs() -> u64 { 60 }
fn default_horizon_days() -> u32 { 60 }
fn default_store_timeout_secs() -> u64 { 5 }
fn default_dispatch_timeout_secs() -> u64 { 10 }
fn default_max_concurrent_dispatches() -> usize { 8 }
fn default_max_dispatch_attempts() -> u32 { 5 }
fn default_reminder_lookback_hours() -> u32 { 24 }
fn default_max_edit_retries() -> u32 { 3 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
            horizon_days: default_horizon_days(),
            store_timeout_secs: default_store_timeout_secs(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
            max_concurrent_dispatches: default_max_concurrent_dispatches(),
            max_dispatch_attempts: default_max_dispatch_attempts(),
            reminder_lookback_hours: default_reminder_lookback_hours(),
            max_edit_retries: default_max_edit_retries(),
        }
    }
}

/// Reminder delivery target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Outbound webhook receiving reminder payloads. None = log only.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_headers: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: CadenceConfig = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.scan_interval_secs, 60);
        assert_eq!(config.scheduler.horizon_days, 60);
        assert_eq!(config.scheduler.max_dispatch_attempts, 5);
        assert!(config.notify.webhook_url.is_none());
    }

    #[test]
    fn test_partial_section_override() {
        let config: CadenceConfig = toml::from_str(
            "[scheduler]\nscan_interval_secs = 15\n\n[notify]\nwebhook_url = \"http://localhost:9000/hook\"\n",
        )
        .unwrap();
        assert_eq!(config.scheduler.scan_interval_secs, 15);
        assert_eq!(config.scheduler.horizon_days, 60);
        assert_eq!(
            config.notify.webhook_url.as_deref(),
            Some("http://localhost:9000/hook")
        );
    }

    #[test]
    fn test_save_and_load_roundtrip_file() {
        let dir = std::env::temp_dir().join("cadence-config-test");
        let path = dir.join("config.toml");
        let mut config = CadenceConfig::default();
        config.scheduler.horizon_days = 14;
        config.save_to(&path).unwrap();

        let loaded = CadenceConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.horizon_days, 14);
        std::fs::remove_dir_all(&dir).ok();
    }
}
