use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::models::NotificationSource;
use crate::util::{parse_bool, parse_csv, parse_duration};

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub broker: FileBrokerConfig,
    #[serde(default)]
    pub pipeline: FilePipelineConfig,
    #[serde(default)]
    pub listener: FileListenerConfig,
    #[serde(default)]
    pub notification: FileNotificationConfig,
    #[serde(default)]
    pub persistence: FilePersistenceConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileBrokerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FilePipelineConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_directory: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileListenerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_retry_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurring_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileNotificationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<NotificationSource>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FilePersistenceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_url: Option<String>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub broker_url: Option<String>,
    pub consumer_name: Option<String>,
    pub block_timeout: Option<Duration>,
    pub services: Option<Vec<String>>,
    pub job_directory: Option<PathBuf>,
    pub max_workers: Option<usize>,
    pub credentials_retry: Option<Duration>,
    pub recurring_interval: Option<Duration>,
    pub notification_enabled: Option<bool>,
    pub notification_source: Option<NotificationSource>,
    pub status_url: Option<String>,
}

impl EnvConfig {
    /// Reads the `MASH_*` variables of the current process.
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the overrides from any variable source. Values that fail to
    /// parse are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        Self {
            config_path: var("MASH_CONFIG").map(PathBuf::from),
            broker_url: var("MASH_BROKER_URL"),
            consumer_name: var("MASH_CONSUMER_NAME"),
            block_timeout: var("MASH_BLOCK_TIMEOUT").and_then(|s| parse_duration(&s)),
            services: var("MASH_SERVICES").map(|s| parse_csv(&s)),
            job_directory: var("MASH_JOB_DIRECTORY").map(PathBuf::from),
            max_workers: var("MASH_MAX_WORKERS").and_then(|s| s.trim().parse().ok()),
            credentials_retry: var("MASH_CREDENTIALS_RETRY").and_then(|s| parse_duration(&s)),
            recurring_interval: var("MASH_RECURRING_INTERVAL")
                .and_then(|s| parse_duration(&s)),
            notification_enabled: var("MASH_NOTIFICATIONS").and_then(|s| parse_bool(&s)),
            notification_source: var("MASH_NOTIFICATION_SOURCE")
                .and_then(|s| s.parse().ok()),
            status_url: var("MASH_STATUS_URL"),
        }
    }
}
