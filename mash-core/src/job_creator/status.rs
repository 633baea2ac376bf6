#[cfg(feature = "http")]
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::Result;
use crate::job::{JobResult, JobStatus};

/// Result fields that stay inside the pipeline and are never forwarded to
/// persistence.
pub const PRIVATE_FIELDS: [&str; 5] = [
    "credentials",
    "cloud_accounts",
    "job_file",
    "notification_email",
    "notification_type",
];

/// Job progress as forwarded to the persistence collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_service: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl StatusUpdate {
    /// Initial record for a freshly submitted job.
    pub fn queued(id: impl Into<String>, first_service: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Queued,
            prev_service: None,
            current_service: Some(first_service.into()),
            errors: Vec::new(),
            fields: Map::new(),
        }
    }

    /// Update for a stage result, with stage-private fields removed.
    pub fn from_result(result: &JobResult, service: &str, next: Option<&str>) -> Self {
        let fields = result
            .fields
            .iter()
            .filter(|(key, _)| !PRIVATE_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Self {
            id: result.id.clone(),
            status: result.status.into(),
            prev_service: Some(service.to_string()),
            current_service: next.map(str::to_string),
            errors: result.errors.clone(),
            fields,
        }
    }
}

/// Persistence collaborator receiving job progress.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn update(&self, update: &StatusUpdate) -> Result<()>;
}

/// Logs status updates; used when no persistence service is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogStatusSink;

#[async_trait]
impl StatusSink for LogStatusSink {
    async fn update(&self, update: &StatusUpdate) -> Result<()> {
        info!(
            job_id = %update.id,
            status = %update.status,
            prev_service = ?update.prev_service,
            current_service = ?update.current_service,
            "job status"
        );
        Ok(())
    }
}

/// Sends each update as `PUT {base_url}/{id}` with a JSON body.
#[cfg(feature = "http")]
#[derive(Clone)]
pub struct HttpStatusSink {
    client: reqwest::Client,
    base_url: String,
}

#[cfg(feature = "http")]
impl fmt::Debug for HttpStatusSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStatusSink")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(feature = "http")]
impl HttpStatusSink {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl StatusSink for HttpStatusSink {
    async fn update(&self, update: &StatusUpdate) -> Result<()> {
        use crate::error::MashError;

        let url = format!("{}/{}", self.base_url, update.id);
        self.client
            .put(&url)
            .json(update)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| MashError::Persistence(format!("PUT {url} failed: {err}")))?;
        Ok(())
    }
}
