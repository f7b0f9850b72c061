//! stagehand.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stagehand_rollout::SchedulerConfig;

const DEFAULT_DATA_DIR: &str = "/var/lib/stagehand";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StagehandConfig {
    pub store: StoreConfig,
    pub scheduler: SchedulerSection,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub interval_minutes: Option<u64>,
    pub error_backoff_secs: Option<u64>,
    pub stop_grace_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub json: bool,
}

impl StagehandConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StagehandConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.store
            .data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    /// Loop timing, with `interval_minutes` taking precedence over the file.
    ///
    /// Rejects a zero or overflowing interval and a back-off that is not
    /// shorter than the interval.
    pub fn scheduler_config(&self, interval_minutes: Option<u64>) -> anyhow::Result<SchedulerConfig> {
        let mut config = SchedulerConfig::default();
        if let Some(minutes) = interval_minutes.or(self.scheduler.interval_minutes) {
            if minutes == 0 {
                anyhow::bail!("interval_minutes must be at least 1");
            }
            if minutes.checked_mul(60).is_none() {
                anyhow::bail!("interval_minutes {minutes} is too large");
            }
            config = config.with_interval_minutes(minutes);
        }
        if let Some(secs) = self.scheduler.error_backoff_secs {
            config.error_backoff = Duration::from_secs(secs);
        }
        if let Some(secs) = self.scheduler.stop_grace_secs {
            config.stop_grace = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }
}
