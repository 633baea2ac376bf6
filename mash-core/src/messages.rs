//! Wire format of broker messages.
//!
//! Every message is a JSON object with exactly one key naming its kind and
//! stage, e.g. `{"test_job": {...}}`, `{"test_job_delete": "<id>"}` or
//! `{"test_result": {...}}`. Bodies are parsed once, here, into typed values.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{MashError, Result};
use crate::job::{JobDocument, JobResult, StageJob};
use crate::stage::JOB_CREATOR_EXCHANGE;

const JOB_SUFFIX: &str = "_job";
const DELETE_SUFFIX: &str = "_job_delete";
const RESULT_SUFFIX: &str = "_result";

/// Splits a single-key envelope into its key and value.
pub fn open_envelope(body: &str) -> Result<(String, Value)> {
    let value: Value = serde_json::from_str(body)?;
    let Value::Object(map) = value else {
        return Err(MashError::InvalidMessage("message is not a JSON object".into()));
    };
    if map.len() != 1 {
        return Err(MashError::InvalidMessage(format!(
            "expected exactly one key, found {}",
            map.len()
        )));
    }
    map.into_iter()
        .next()
        .ok_or_else(|| MashError::InvalidMessage("empty message".into()))
}

fn envelope<T: Serialize>(key: String, value: &T) -> Result<String> {
    let mut map = Map::new();
    map.insert(key, serde_json::to_value(value)?);
    Ok(Value::Object(map).to_string())
}

/// Message consumed by a stage runtime.
#[derive(Clone, Debug, PartialEq)]
pub enum ServiceMessage {
    NewJob { service: String, job: StageJob },
    Delete { service: String, job_id: String },
    Result { service: String, result: JobResult },
}

impl ServiceMessage {
    pub fn parse(body: &str) -> Result<Self> {
        let (key, value) = open_envelope(body)?;
        if let Some(service) = key.strip_suffix(DELETE_SUFFIX) {
            let job_id = value
                .as_str()
                .ok_or_else(|| MashError::InvalidMessage(format!("`{key}` must carry a job id")))?;
            return Ok(ServiceMessage::Delete {
                service: service.to_string(),
                job_id: job_id.to_string(),
            });
        }
        if let Some(service) = key.strip_suffix(JOB_SUFFIX) {
            let job = serde_json::from_value(value)
                .map_err(|err| MashError::InvalidJob(format!("`{key}`: {err}")))?;
            return Ok(ServiceMessage::NewJob {
                service: service.to_string(),
                job,
            });
        }
        if let Some(service) = key.strip_suffix(RESULT_SUFFIX) {
            let result = serde_json::from_value(value)
                .map_err(|err| MashError::InvalidMessage(format!("`{key}`: {err}")))?;
            return Ok(ServiceMessage::Result {
                service: service.to_string(),
                result,
            });
        }
        Err(MashError::InvalidMessage(format!("unknown message kind `{key}`")))
    }
}

/// Message consumed by the pipeline sequencer on its own exchange.
#[derive(Clone, Debug, PartialEq)]
pub enum SubmissionMessage {
    Submit(Box<JobDocument>),
    Delete(String),
}

impl SubmissionMessage {
    pub fn parse(body: &str) -> Result<Self> {
        let (key, value) = open_envelope(body)?;
        let job_key = format!("{JOB_CREATOR_EXCHANGE}{JOB_SUFFIX}");
        let delete_key = format!("{JOB_CREATOR_EXCHANGE}{DELETE_SUFFIX}");
        if key == job_key {
            let doc = serde_json::from_value(value)
                .map_err(|err| MashError::InvalidJob(format!("`{key}`: {err}")))?;
            Ok(SubmissionMessage::Submit(Box::new(doc)))
        } else if key == delete_key {
            value
                .as_str()
                .map(|id| SubmissionMessage::Delete(id.to_string()))
                .ok_or_else(|| MashError::InvalidMessage(format!("`{key}` must carry a job id")))
        } else {
            Err(MashError::InvalidMessage(format!("unknown message kind `{key}`")))
        }
    }
}

pub fn job_body<T: Serialize>(service: &str, job: &T) -> Result<String> {
    envelope(format!("{service}{JOB_SUFFIX}"), job)
}

pub fn delete_body(service: &str, job_id: &str) -> String {
    let mut map = Map::new();
    map.insert(
        format!("{service}{DELETE_SUFFIX}"),
        Value::String(job_id.to_string()),
    );
    Value::Object(map).to_string()
}

pub fn result_body(service: &str, result: &JobResult) -> Result<String> {
    envelope(format!("{service}{RESULT_SUFFIX}"), result)
}

pub fn submission_body(doc: &JobDocument) -> Result<String> {
    job_body(JOB_CREATOR_EXCHANGE, doc)
}

pub fn submission_delete_body(job_id: &str) -> String {
    delete_body(JOB_CREATOR_EXCHANGE, job_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ResultStatus;
    use serde_json::json;

    #[test]
    fn parses_each_stage_message_kind() {
        let job = ServiceMessage::parse(
            r#"{"test_job": {"id": "42", "utctime": "now", "last_service": "publish"}}"#,
        )
        .unwrap();
        assert!(matches!(job, ServiceMessage::NewJob { ref service, .. } if service == "test"));

        let delete = ServiceMessage::parse(r#"{"raw_image_upload_job_delete": "42"}"#).unwrap();
        assert_eq!(
            delete,
            ServiceMessage::Delete {
                service: "raw_image_upload".into(),
                job_id: "42".into()
            }
        );

        let result = ServiceMessage::parse(
            r#"{"upload_result": {"id": "42", "status": "failed", "errors": ["boom"]}}"#,
        )
        .unwrap();
        match result {
            ServiceMessage::Result { service, result } => {
                assert_eq!(service, "upload");
                assert_eq!(result.status, ResultStatus::Failed);
                assert_eq!(result.errors, vec!["boom".to_string()]);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_envelopes() {
        assert!(ServiceMessage::parse("[]").is_err());
        assert!(ServiceMessage::parse(r#"{"a_job": {}, "b_job": {}}"#).is_err());
        assert!(ServiceMessage::parse(r#"{"test_unknown": 1}"#).is_err());
        assert!(matches!(
            ServiceMessage::parse(r#"{"test_job": {"id": "42"}}"#),
            Err(MashError::InvalidJob(_))
        ));
    }

    #[test]
    fn bodies_use_stage_prefixed_keys() {
        let result = JobResult::new("42", ResultStatus::Success);
        let body = result_body("replicate", &result).unwrap();
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["replicate_result"]["status"], json!("success"));
        assert_eq!(delete_body("test", "42"), r#"{"test_job_delete":"42"}"#);
    }

    #[test]
    fn submission_round_trips_through_parser() {
        let doc: JobDocument = serde_json::from_value(json!({
            "id": "42", "utctime": "now", "last_service": "publish"
        }))
        .unwrap();
        let parsed = SubmissionMessage::parse(&submission_body(&doc).unwrap()).unwrap();
        assert_eq!(parsed, SubmissionMessage::Submit(Box::new(doc)));
        assert_eq!(
            SubmissionMessage::parse(&submission_delete_body("42")).unwrap(),
            SubmissionMessage::Delete("42".into())
        );
    }
}
