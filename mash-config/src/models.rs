use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use mash_core::ServiceOrder;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub pipeline: PipelineConfig,
    pub listener: ListenerConfig,
    pub notification: NotificationConfig,
    pub persistence: PersistenceConfig,
    pub metadata: ConfigMetadata,
}

impl Config {
    /// The validated stage order shared by every process of the deployment.
    pub fn service_order(&self) -> mash_core::Result<ServiceOrder> {
        ServiceOrder::new(self.pipeline.services.iter().cloned())
    }

    /// Job file directory owned by the runtime of `service`.
    pub fn stage_directory(&self, service: &str) -> PathBuf {
        self.pipeline.job_directory.join(service)
    }

    /// Redis consumer name for a process playing `role`. Stable across
    /// restarts so pending entries are re-read by the same consumer.
    pub fn consumer_name(&self, role: &str) -> String {
        self.broker
            .consumer_name
            .clone()
            .unwrap_or_else(|| role.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub consumer_name: Option<String>,
    pub block_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub services: Vec<String>,
    pub job_directory: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub max_workers: usize,
    pub credentials_retry: Duration,
    pub recurring_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub source: NotificationSource,
}

impl NotificationConfig {
    /// Whether the job creator sends notifications in this deployment.
    pub fn from_job_creator(&self) -> bool {
        self.enabled && self.source == NotificationSource::JobCreator
    }

    /// Whether stage runtimes send notifications in this deployment.
    pub fn from_listener(&self) -> bool {
        self.enabled && self.source == NotificationSource::Listener
    }
}

/// Which component evaluates the notification gate. Exactly one of them does,
/// so a job is never notified twice.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSource {
    #[default]
    #[serde(alias = "sequencer", alias = "jobcreator")]
    JobCreator,
    Listener,
}

impl fmt::Display for NotificationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JobCreator => f.write_str("job_creator"),
            Self::Listener => f.write_str("listener"),
        }
    }
}

impl FromStr for NotificationSource {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "job_creator" | "jobcreator" | "sequencer" => Ok(Self::JobCreator),
            "listener" => Ok(Self::Listener),
            other => Err(format!("unknown notification source `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Base URL of the job status service; updates are only logged when unset.
    pub status_url: Option<Url>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
