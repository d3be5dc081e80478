use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::waiter::RetryPolicy;

/// Optional TOML configuration. Connection URLs are secrets and stay in
/// env vars / CLI flags; this file only carries tunables.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub migrations: MigrationsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationsConfig {
    /// Relative paths are resolved against the config file's directory.
    pub patch_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub retries: u32,
    pub min_delay_ms: u64,
    pub factor: u32,
    pub max_delay_ms: u64,
    pub timeout_secs: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            retries: policy.retries,
            min_delay_ms: policy.min_delay.as_millis() as u64,
            factor: policy.factor,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            timeout_secs: policy.timeout.map(|t| t.as_secs()),
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(c: RetryConfig) -> Self {
        Self {
            retries: c.retries,
            min_delay: Duration::from_millis(c.min_delay_ms),
            factor: c.factor,
            max_delay: Duration::from_millis(c.max_delay_ms),
            timeout: c.timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let mut config: FileConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    if let (Some(dir), Some(parent)) = (config.migrations.patch_dir.as_mut(), path.parent()) {
        if dir.is_relative() {
            *dir = parent.join(&*dir);
        }
    }
    Ok(config)
}
