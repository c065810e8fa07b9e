use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LecternConfig {
    pub completion: CompletionSection,
    pub persistence: PersistenceSection,
    pub breaker: BreakerSection,
    pub playback: PlaybackSection,
    pub storage: StorageSection,
}

impl LecternConfig {
    pub fn validate(&self) -> Result<()> {
        let threshold = self.completion.threshold_percent;
        if !threshold.is_finite() || threshold <= 0.0 || threshold > 100.0 {
            return Err(ConfigError::Invalid {
                field: "completion.threshold_percent",
                reason: format!("{threshold} is outside (0, 100]"),
            });
        }
        let override_threshold = self.completion.override_threshold_percent;
        if !override_threshold.is_finite() || !(0.0..=100.0).contains(&override_threshold) {
            return Err(ConfigError::Invalid {
                field: "completion.override_threshold_percent",
                reason: format!("{override_threshold} is outside [0, 100]"),
            });
        }
        if self.persistence.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "persistence.max_attempts",
                reason: "must allow at least one attempt".into(),
            });
        }
        if self.breaker.failure_threshold == 0 || self.breaker.half_open_successes == 0 {
            return Err(ConfigError::Invalid {
                field: "breaker",
                reason: "thresholds must be positive".into(),
            });
        }
        if self.playback.max_active_instances != 1 {
            return Err(ConfigError::Invalid {
                field: "playback.max_active_instances",
                reason: format!(
                    "{} requested, exactly one mounted player is supported",
                    self.playback.max_active_instances
                ),
            });
        }
        Ok(())
    }

    pub fn resolve_path<P: AsRef<Path>>(&self, base_dir: P, candidate: &str) -> PathBuf {
        let path = Path::new(candidate);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.as_ref().join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompletionSection {
    pub threshold_percent: f64,
    pub override_threshold_percent: f64,
}

impl Default for CompletionSection {
    fn default() -> Self {
        Self {
            threshold_percent: 95.0,
            override_threshold_percent: 95.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceSection {
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub retry_jitter_ms: u64,
    pub saving_timeout_ms: u64,
    pub progress_save_interval_seconds: u64,
}

impl PersistenceSection {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn saving_timeout(&self) -> Duration {
        Duration::from_millis(self.saving_timeout_ms.max(1))
    }

    pub fn progress_save_interval(&self) -> Duration {
        Duration::from_secs(self.progress_save_interval_seconds)
    }
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_ms: 2_000,
            retry_jitter_ms: 0,
            saving_timeout_ms: 15_000,
            progress_save_interval_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub open_for_seconds: u64,
    pub half_open_successes: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_for_seconds: 60,
            half_open_successes: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackSection {
    pub poll_interval_ms: u64,
    pub init_timeout_ms: u64,
    pub max_active_instances: usize,
}

impl PlaybackSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

impl Default for PlaybackSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            init_timeout_ms: 10_000,
            max_active_instances: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub database: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database: "data/lectern.sqlite".to_string(),
        }
    }
}

pub fn load_lectern_config<P: AsRef<Path>>(path: P) -> Result<LecternConfig> {
    let config: LecternConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
