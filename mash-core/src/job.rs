use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{MashError, Result};
use crate::notify::{NotificationPrefs, NotificationType};
use crate::stage::ServiceOrder;

/// When a job runs: once as soon as possible, on every upstream cycle, or at a
/// fixed instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UtcTime {
    Now,
    Always,
    At(DateTime<Utc>),
}

impl UtcTime {
    pub fn is_recurring(&self) -> bool {
        matches!(self, UtcTime::Always)
    }

    /// Instant the scheduler should hold the job until, if any.
    pub fn run_at(&self) -> Option<DateTime<Utc>> {
        match self {
            UtcTime::At(at) => Some(*at),
            UtcTime::Now | UtcTime::Always => None,
        }
    }
}

impl FromStr for UtcTime {
    type Err = MashError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "now" => Ok(UtcTime::Now),
            "always" => Ok(UtcTime::Always),
            other => DateTime::parse_from_rfc3339(other)
                .map(|at| UtcTime::At(at.with_timezone(&Utc)))
                .map_err(|err| {
                    MashError::InvalidJob(format!("invalid utctime `{other}`: {err}"))
                }),
        }
    }
}

impl fmt::Display for UtcTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UtcTime::Now => write!(f, "now"),
            UtcTime::Always => write!(f, "always"),
            UtcTime::At(at) => write!(f, "{}", at.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }
}

impl Serialize for UtcTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UtcTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Public cloud a job targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudTarget {
    Ec2,
    Azure,
    Gce,
    Oci,
    Aliyun,
}

impl fmt::Display for CloudTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudTarget::Ec2 => write!(f, "ec2"),
            CloudTarget::Azure => write!(f, "azure"),
            CloudTarget::Gce => write!(f, "gce"),
            CloudTarget::Oci => write!(f, "oci"),
            CloudTarget::Aliyun => write!(f, "aliyun"),
        }
    }
}

fn generate_job_id() -> String {
    Uuid::new_v4().to_string()
}

/// Checks that a job id is non-empty and limited to ASCII alphanumerics, `-`
/// and `_`. Job ids name the persisted job files.
pub fn check_job_id(id: &str) -> Result<()> {
    let safe = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if safe {
        Ok(())
    } else {
        Err(MashError::InvalidJob(format!(
            "job id `{id}` cannot be used as a file name"
        )))
    }
}

/// Job as submitted to the pipeline sequencer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobDocument {
    #[serde(default = "generate_job_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudTarget>,
    pub utctime: UtcTime,
    pub last_service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_email: Option<String>,
    #[serde(default)]
    pub notification_type: NotificationType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cloud_accounts: Vec<String>,
    /// Provider payload; opaque to the orchestration engine.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl JobDocument {
    pub fn validate(&self, order: &ServiceOrder) -> Result<()> {
        check_job_id(&self.id)?;
        if !order.contains(&self.last_service) {
            return Err(MashError::InvalidJob(format!(
                "job {} names unknown last_service `{}`",
                self.id, self.last_service
            )));
        }
        Ok(())
    }

    pub fn notification_prefs(&self) -> NotificationPrefs {
        NotificationPrefs {
            email: self.notification_email.clone(),
            kind: self.notification_type,
            recurring: self.utctime.is_recurring(),
        }
    }

    /// Human-facing identifier of the image or target for notifications.
    pub fn display_target(&self) -> String {
        match (&self.image, self.cloud) {
            (Some(image), Some(cloud)) => format!("{image} ({cloud})"),
            (Some(image), None) => image.clone(),
            (None, Some(cloud)) => cloud.to_string(),
            (None, None) => "unnamed image".to_string(),
        }
    }
}

/// Stage-shaped job document as received by one stage runtime and persisted
/// to its job directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageJob {
    pub id: String,
    pub utctime: UtcTime,
    pub last_service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_email: Option<String>,
    #[serde(default)]
    pub notification_type: NotificationType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cloud_accounts: Vec<String>,
    /// Stage-specific fields produced by the message builder.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl StageJob {
    pub fn is_recurring(&self) -> bool {
        self.utctime.is_recurring()
    }

    /// Checks the job can run on `service`: known id, known cut-off, and
    /// `service` within the job's range.
    pub fn validate(&self, order: &ServiceOrder, service: &str) -> Result<()> {
        check_job_id(&self.id)?;
        if !order.contains(&self.last_service) {
            return Err(MashError::InvalidJob(format!(
                "job {} names unknown last_service `{}`",
                self.id, self.last_service
            )));
        }
        if !order.includes(service, &self.last_service) {
            return Err(MashError::InvalidJob(format!(
                "job {} ends at `{}` and never reaches `{service}`",
                self.id, self.last_service
            )));
        }
        Ok(())
    }

    pub fn notification_prefs(&self) -> NotificationPrefs {
        NotificationPrefs {
            email: self.notification_email.clone(),
            kind: self.notification_type,
            recurring: self.is_recurring(),
        }
    }

    pub fn display_target(&self) -> String {
        ["image", "cloud_image_name"]
            .iter()
            .find_map(|key| self.fields.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| "unnamed image".to_string())
    }
}

/// Lifecycle of a job inside one stage runtime.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Scheduled,
    Running,
    Success,
    Failed,
    Exception,
    Reported,
    Deleted,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Queued => "queued",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Exception => "exception",
            JobStatus::Reported => "reported",
            JobStatus::Deleted => "deleted",
        };
        f.write_str(label)
    }
}

/// Status carried by a stage result message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failed,
    Exception,
    /// Explicit delete directive propagated down the pipeline.
    Delete,
}

impl ResultStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ResultStatus::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ResultStatus::Failed | ResultStatus::Exception)
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResultStatus::Success => "success",
            ResultStatus::Failed => "failed",
            ResultStatus::Exception => "exception",
            ResultStatus::Delete => "delete",
        };
        f.write_str(label)
    }
}

impl From<ResultStatus> for JobStatus {
    fn from(status: ResultStatus) -> Self {
        match status {
            ResultStatus::Success => JobStatus::Success,
            ResultStatus::Failed => JobStatus::Failed,
            ResultStatus::Exception => JobStatus::Exception,
            ResultStatus::Delete => JobStatus::Deleted,
        }
    }
}

/// Body of a `<stage>_result` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl JobResult {
    pub fn new(id: impl Into<String>, status: ResultStatus) -> Self {
        Self {
            id: id.into(),
            status,
            errors: Vec::new(),
            fields: Map::new(),
        }
    }

    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn utctime_accepts_directives_and_instants() {
        assert_eq!("now".parse::<UtcTime>().unwrap(), UtcTime::Now);
        assert_eq!("always".parse::<UtcTime>().unwrap(), UtcTime::Always);
        let at: UtcTime = "2026-10-19T10:00:00+02:00".parse().unwrap();
        assert_eq!(at.to_string(), "2026-10-19T08:00:00Z");
        assert!(at.run_at().is_some());
        assert!("tomorrow".parse::<UtcTime>().is_err());
    }

    #[test]
    fn job_document_generates_missing_id_and_keeps_payload() {
        let doc: JobDocument = serde_json::from_value(json!({
            "cloud": "ec2",
            "utctime": "now",
            "last_service": "test",
            "image": "sles-16",
            "target_regions": {"us-east-1": {}}
        }))
        .unwrap();
        assert!(Uuid::parse_str(&doc.id).is_ok());
        assert_eq!(doc.cloud, Some(CloudTarget::Ec2));
        assert!(doc.payload.contains_key("target_regions"));
        assert_eq!(doc.display_target(), "sles-16 (ec2)");
    }

    #[test]
    fn unknown_cloud_is_rejected_at_the_boundary() {
        let parsed = serde_json::from_value::<JobDocument>(json!({
            "cloud": "floppy",
            "utctime": "now",
            "last_service": "test"
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn stage_job_validation_checks_range() {
        let order = ServiceOrder::new(["build", "upload", "test"]).unwrap();
        let job: StageJob = serde_json::from_value(json!({
            "id": "42",
            "utctime": "always",
            "last_service": "upload"
        }))
        .unwrap();
        assert!(job.is_recurring());
        assert!(job.validate(&order, "build").is_ok());
        assert!(job.validate(&order, "test").is_err());
    }

    #[test]
    fn ids_that_cannot_name_a_file_fail_validation() {
        let order = ServiceOrder::new(["build", "upload", "test"]).unwrap();
        for id in ["img.v1", "../escape", "a b", ""] {
            let job: StageJob = serde_json::from_value(json!({
                "id": id,
                "utctime": "now",
                "last_service": "test"
            }))
            .unwrap();
            assert!(
                matches!(job.validate(&order, "build"), Err(MashError::InvalidJob(_))),
                "stage job `{id}` should be rejected"
            );

            let doc: JobDocument = serde_json::from_value(json!({
                "id": id,
                "utctime": "now",
                "last_service": "test"
            }))
            .unwrap();
            assert!(doc.validate(&order).is_err(), "document `{id}` should be rejected");
        }
        assert!(check_job_id("2f1c-job_7").is_ok());
    }

    #[test]
    fn result_defaults_errors_and_flattens_fields() {
        let result: JobResult = serde_json::from_value(json!({
            "id": "42",
            "status": "failed",
            "cloud_image_name": "img"
        }))
        .unwrap();
        assert!(result.errors.is_empty());
        assert!(result.status.is_failure());
        assert_eq!(result.fields["cloud_image_name"], json!("img"));
    }
}
