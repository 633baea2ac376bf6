use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

use super::credentials::Credentials;
use crate::error::Result;
use crate::job::{ResultStatus, StageJob};

/// What a unit of work reports back when it finishes.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkOutcome {
    pub status: ResultStatus,
    pub errors: Vec<String>,
    /// Stage-specific result fields forwarded downstream.
    pub fields: Map<String, Value>,
}

impl WorkOutcome {
    pub fn success() -> Self {
        Self {
            status: ResultStatus::Success,
            errors: Vec::new(),
            fields: Map::new(),
        }
    }

    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            status: ResultStatus::Failed,
            errors,
            fields: Map::new(),
        }
    }

    pub fn exception(error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Exception,
            errors: vec![error.into()],
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Receives progress lines emitted by a unit of work.
pub trait JobObserver: Send + Sync {
    fn log(&self, job_id: &str, message: &str);
}

/// Forwards job log lines to `tracing` with the job id attached.
#[derive(Clone, Debug)]
pub struct TracingObserver {
    service: String,
}

impl TracingObserver {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl JobObserver for TracingObserver {
    fn log(&self, job_id: &str, message: &str) {
        info!(target: "mash::job", job_id, service = %self.service, "{message}");
    }
}

/// Everything a unit of work is constructed from. The observer is part of the
/// context so a worker is fully wired before it can run.
#[derive(Clone)]
pub struct WorkerContext {
    pub service: String,
    pub job: StageJob,
    pub job_file: PathBuf,
    pub iteration: u32,
    pub credentials: Option<Credentials>,
    pub observer: Arc<dyn JobObserver>,
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("service", &self.service)
            .field("job_id", &self.job.id)
            .field("job_file", &self.job_file)
            .field("iteration", &self.iteration)
            .field("has_credentials", &self.credentials.is_some())
            .finish()
    }
}

impl WorkerContext {
    pub fn log(&self, message: &str) {
        self.observer.log(&self.job.id, message);
    }
}

/// One stage's unit of work for one job.
#[async_trait]
pub trait StageWorker: Send {
    /// Runs the work. An `Err` is reported downstream as `exception`.
    async fn run(&mut self) -> Result<WorkOutcome>;
}

/// Builds units of work for a stage.
pub trait StageWorkerFactory: Send + Sync {
    /// Rejects jobs this stage can never run. Called when a job is announced;
    /// a rejected job is dropped before it is tracked.
    fn validate(&self, _job: &StageJob) -> Result<()> {
        Ok(())
    }

    fn build(&self, ctx: WorkerContext) -> Result<Box<dyn StageWorker>>;
}
