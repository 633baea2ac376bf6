use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::worker::{StageWorker, StageWorkerFactory, WorkOutcome, WorkerContext};
use crate::error::{MashError, Result};

const STDERR_TAIL: usize = 20;

/// Runs an external program once per job.
///
/// The program sees `MASH_JOB_ID`, `MASH_SERVICE`, `MASH_JOB_FILE` and
/// `MASH_ITERATION` in its environment, plus `MASH_CREDENTIALS` (JSON) when
/// the job has cloud accounts. Exit status 0 is success. Each stdout line is
/// written to the job log; a last stdout line holding a JSON object becomes
/// the result fields. On failure the tail of stderr becomes the error list.
#[derive(Clone, Debug)]
pub struct CommandWorkerFactory {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandWorkerFactory {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl StageWorkerFactory for CommandWorkerFactory {
    fn build(&self, ctx: WorkerContext) -> Result<Box<dyn StageWorker>> {
        Ok(Box::new(CommandWorker {
            program: self.program.clone(),
            args: self.args.clone(),
            ctx,
        }))
    }
}

#[derive(Debug)]
struct CommandWorker {
    program: PathBuf,
    args: Vec<String>,
    ctx: WorkerContext,
}

#[async_trait]
impl StageWorker for CommandWorker {
    async fn run(&mut self) -> Result<WorkOutcome> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("MASH_JOB_ID", &self.ctx.job.id)
            .env("MASH_SERVICE", &self.ctx.service)
            .env("MASH_JOB_FILE", &self.ctx.job_file)
            .env("MASH_ITERATION", self.ctx.iteration.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(credentials) = &self.ctx.credentials {
            command.env("MASH_CREDENTIALS", serde_json::to_string(credentials)?);
        }

        let mut child = command.spawn().map_err(|err| {
            MashError::Internal(format!(
                "failed to start {}: {err}",
                self.program.display()
            ))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MashError::Internal("child stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MashError::Internal("child stderr not captured".into()))?;

        let stderr_tail = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail = VecDeque::with_capacity(STDERR_TAIL);
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        });

        let mut last_line = None;
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            self.ctx.log(&line);
            last_line = Some(line);
        }

        let status = child.wait().await?;
        let tail = stderr_tail
            .await
            .map_err(|err| MashError::Internal(format!("stderr reader failed: {err}")))?;
        debug!(job_id = %self.ctx.job.id, status = %status, "job command exited");

        let fields = last_line
            .as_deref()
            .and_then(|line| serde_json::from_str::<Map<String, Value>>(line).ok())
            .unwrap_or_default();

        let mut outcome = if status.success() {
            WorkOutcome::success()
        } else {
            let mut errors: Vec<String> = tail.into_iter().collect();
            if errors.is_empty() {
                errors.push(format!("{} exited with {status}", self.program.display()));
            }
            WorkOutcome::failed(errors)
        };
        outcome.fields = fields;
        Ok(outcome)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::job::{ResultStatus, StageJob};
    use crate::listener::worker::JobObserver;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Lines(Mutex<Vec<String>>);

    impl JobObserver for Lines {
        fn log(&self, _job_id: &str, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    fn context(observer: Arc<Lines>) -> WorkerContext {
        let job: StageJob = serde_json::from_value(json!({
            "id": "cmd-1", "utctime": "now", "last_service": "test"
        }))
        .unwrap();
        WorkerContext {
            service: "test".into(),
            job,
            job_file: PathBuf::from("/tmp/job-cmd-1.json"),
            iteration: 0,
            credentials: None,
            observer,
        }
    }

    fn shell(script: &str) -> CommandWorkerFactory {
        CommandWorkerFactory::new("/bin/sh", vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn successful_command_reports_json_fields() {
        let lines = Arc::new(Lines::default());
        let factory = shell(r#"echo "testing $MASH_JOB_ID on $MASH_SERVICE"; echo '{"test_result": "pass"}'"#);
        let mut worker = factory.build(context(Arc::clone(&lines))).unwrap();

        let outcome = worker.run().await.unwrap();
        assert_eq!(outcome.status, ResultStatus::Success);
        assert_eq!(outcome.fields.get("test_result"), Some(&json!("pass")));
        assert_eq!(lines.0.lock().unwrap()[0], "testing cmd-1 on test");
    }

    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let factory = shell("echo 'instance never booted' >&2; exit 3");
        let mut worker = factory.build(context(Arc::default())).unwrap();

        let outcome = worker.run().await.unwrap();
        assert_eq!(outcome.status, ResultStatus::Failed);
        assert_eq!(outcome.errors, vec!["instance never booted".to_string()]);
    }
}
