use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use mash_core::broker::{Broker, Consumer, InMemoryBroker};
use mash_core::listener::{
    NewJobOutcome, StageRuntime, StageRuntimeConfig, StageWorker, StageWorkerFactory, WorkOutcome,
    WorkerContext,
};
use mash_core::messages::{ServiceMessage, delete_body, job_body, result_body};
use mash_core::stage::{JOB_DOCUMENT_KEY, LISTENER_MSG_KEY};
use mash_core::store::JobStore;
use mash_core::{JobResult, JobStatus, MashError, ResultStatus, ServiceOrder, StageJob};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum Behaviour {
    Succeed,
    Raise,
}

struct Recording {
    behaviour: Behaviour,
    runs: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    gate: Semaphore,
}

impl Recording {
    fn new(behaviour: Behaviour, open: bool) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            runs: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            gate: Semaphore::new(if open { 1_000 } else { 0 }),
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

struct RecordingFactory(Arc<Recording>);

impl StageWorkerFactory for RecordingFactory {
    fn build(&self, ctx: WorkerContext) -> mash_core::Result<Box<dyn StageWorker>> {
        Ok(Box::new(RecordingWorker {
            shared: Arc::clone(&self.0),
            ctx,
        }))
    }
}

struct RecordingWorker {
    shared: Arc<Recording>,
    ctx: WorkerContext,
}

#[async_trait]
impl StageWorker for RecordingWorker {
    async fn run(&mut self) -> mash_core::Result<WorkOutcome> {
        let shared = &self.shared;
        let now = shared.active.fetch_add(1, Ordering::SeqCst) + 1;
        shared.max_active.fetch_max(now, Ordering::SeqCst);
        shared.runs.fetch_add(1, Ordering::SeqCst);
        self.ctx.log("working");

        let permit = shared.gate.acquire().await;
        shared.active.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        match shared.behaviour {
            Behaviour::Succeed => {
                Ok(WorkOutcome::success().with_field("iteration", json!(self.ctx.iteration)))
            }
            Behaviour::Raise => Err(MashError::Internal("instance refused to boot".into())),
        }
    }
}

fn order() -> ServiceOrder {
    ServiceOrder::new(["build", "test", "publish"]).unwrap()
}

fn stage_job(id: &str, utctime: &str) -> StageJob {
    serde_json::from_value(json!({
        "id": id,
        "utctime": utctime,
        "last_service": "publish",
        "image": "sles-16-byos"
    }))
    .unwrap()
}

fn config(service: &str, dir: PathBuf) -> StageRuntimeConfig {
    StageRuntimeConfig {
        service: service.to_string(),
        order: order(),
        job_directory: dir,
        max_workers: 4,
        credentials_retry: Duration::from_millis(50),
        recurring_interval: Duration::from_secs(3600),
    }
}

async fn runtime_for(
    service: &str,
    tmp: &TempDir,
    broker: &InMemoryBroker,
    recording: &Arc<Recording>,
) -> StageRuntime {
    StageRuntime::new(
        config(service, tmp.path().join(service)),
        Arc::new(broker.clone()),
        Arc::new(RecordingFactory(Arc::clone(recording))),
        None,
    )
    .await
    .unwrap()
}

fn spawn_run(runtime: &StageRuntime, shutdown: &CancellationToken) -> JoinHandle<mash_core::Result<()>> {
    let runtime = runtime.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move { runtime.run(shutdown).await })
}

/// A running `test` stage plus a consumer standing in for the next stage.
struct Harness {
    tmp: TempDir,
    broker: InMemoryBroker,
    runtime: StageRuntime,
    recording: Arc<Recording>,
    results: Consumer,
    shutdown: CancellationToken,
    task: JoinHandle<mash_core::Result<()>>,
}

impl Harness {
    async fn start(behaviour: Behaviour, open: bool) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let broker = InMemoryBroker::new();
        let downstream = broker
            .bind_queue("test", LISTENER_MSG_KEY, "job_creator")
            .await
            .unwrap();
        let results = broker.consume(&downstream).await.unwrap();

        let recording = Recording::new(behaviour, open);
        let runtime = runtime_for("test", &tmp, &broker, &recording).await;
        runtime.bind().await.unwrap();

        let shutdown = CancellationToken::new();
        let task = spawn_run(&runtime, &shutdown);

        Self {
            tmp,
            broker,
            runtime,
            recording,
            results,
            shutdown,
            task,
        }
    }

    async fn announce(&self, job: &StageJob) {
        self.broker
            .publish("test", JOB_DOCUMENT_KEY, &job_body("test", job).unwrap())
            .await
            .unwrap();
        self.wait_for_status(&job.id, Some(JobStatus::Queued)).await;
    }

    async fn upstream(&self, result: JobResult) {
        self.broker
            .publish("build", LISTENER_MSG_KEY, &result_body("build", &result).unwrap())
            .await
            .unwrap();
    }

    async fn next_result(&mut self) -> JobResult {
        let delivery = tokio::time::timeout(Duration::from_secs(5), self.results.next())
            .await
            .expect("a result within five seconds")
            .expect("results stream open");
        let message = ServiceMessage::parse(&delivery.body).unwrap();
        delivery.ack().await.unwrap();
        match message {
            ServiceMessage::Result { service, result } => {
                assert_eq!(service, "test");
                result
            }
            other => panic!("expected a stage result, got {other:?}"),
        }
    }

    async fn wait_for_status(&self, job_id: &str, status: Option<JobStatus>) {
        for _ in 0..500 {
            if self.runtime.job_status(job_id).await == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "job {job_id} never reached {status:?}, last seen {:?}",
            self.runtime.job_status(job_id).await
        );
    }

    async fn wait_for_unacked(&self, queue: &str, expected: usize) {
        for _ in 0..500 {
            if self.broker.unacked(queue).await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{queue} never settled at {expected} unacknowledged deliveries");
    }

    async fn wait_for_runs(&self, expected: usize) {
        for _ in 0..500 {
            if self.recording.runs() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("unit of work never ran {expected} times");
    }

    /// Stops the runtime with its in-flight work unfinished and starts a
    /// fresh one on the same job directory and broker.
    async fn restart(self, recording: Arc<Recording>) -> Self {
        self.shutdown.cancel();
        self.task.await.unwrap().unwrap();

        let runtime = runtime_for("test", &self.tmp, &self.broker, &recording).await;
        let shutdown = CancellationToken::new();
        let task = spawn_run(&runtime, &shutdown);
        Self {
            tmp: self.tmp,
            broker: self.broker,
            runtime,
            recording,
            results: self.results,
            shutdown,
            task,
        }
    }

    async fn delete(&self, job_id: &str) {
        self.broker
            .publish("test", JOB_DOCUMENT_KEY, &delete_body("test", job_id))
            .await
            .unwrap();
    }

    async fn wait_for_idle(&self) {
        for _ in 0..500 {
            if self.runtime.active_runs().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scheduler never drained");
    }

    async fn results_sent(&self) -> usize {
        self.broker
            .published_to("test")
            .await
            .iter()
            .filter(|msg| msg.routing_key == LISTENER_MSG_KEY)
            .count()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn announcing_a_tracked_job_again_is_a_duplicate() {
    let tmp = tempfile::tempdir().unwrap();
    let broker = InMemoryBroker::new();
    let recording = Recording::new(Behaviour::Succeed, true);
    let runtime = runtime_for("test", &tmp, &broker, &recording).await;

    let job = stage_job("dup-1", "now");
    assert_eq!(
        runtime.handle_new_job(job.clone(), None).await.unwrap(),
        NewJobOutcome::Queued
    );
    assert_eq!(
        runtime.handle_new_job(job, None).await.unwrap(),
        NewJobOutcome::Duplicate
    );
    assert_eq!(runtime.tracked_ids().await, vec!["dup-1".to_string()]);
}

#[tokio::test]
async fn job_that_never_reaches_the_stage_is_dropped() {
    let tmp = tempfile::tempdir().unwrap();
    let broker = InMemoryBroker::new();
    let recording = Recording::new(Behaviour::Succeed, true);
    let runtime = runtime_for("publish", &tmp, &broker, &recording).await;

    let mut job = stage_job("short-1", "now");
    job.last_service = "test".into();
    let err = runtime.handle_new_job(job, None).await.unwrap_err();
    assert!(matches!(err, MashError::InvalidJob(_)));
    assert!(runtime.tracked_ids().await.is_empty());
}

#[tokio::test]
async fn duplicate_upstream_signals_run_the_job_once() {
    let mut harness = Harness::start(Behaviour::Succeed, false).await;
    let job = stage_job("once-1", "now");
    harness.announce(&job).await;

    let success = JobResult::new("once-1", ResultStatus::Success);
    harness.upstream(success.clone()).await;
    harness.upstream(success).await;

    // The first signal waits for the run to finish; the duplicate is settled.
    harness.wait_for_status("once-1", Some(JobStatus::Running)).await;
    harness.wait_for_unacked("build.listener", 1).await;
    harness.wait_for_runs(1).await;
    assert_eq!(harness.recording.runs(), 1);

    harness.recording.gate.add_permits(1_000);
    let result = harness.next_result().await;
    assert_eq!(result.id, "once-1");
    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(result.fields["iteration"], json!(0));

    harness.wait_for_status("once-1", None).await;
    harness.wait_for_unacked("build.listener", 0).await;
    assert_eq!(harness.recording.runs(), 1);
    assert_eq!(harness.recording.max_active.load(Ordering::SeqCst), 1);
    harness.stop().await;
}

#[tokio::test]
async fn upstream_failure_deletes_job_and_reports_downstream() {
    let mut harness = Harness::start(Behaviour::Succeed, true).await;
    harness.announce(&stage_job("fail-1", "now")).await;
    let job_file = harness.tmp.path().join("test").join("job-fail-1.json");
    assert!(job_file.exists());

    harness
        .upstream(
            JobResult::new("fail-1", ResultStatus::Failed)
                .with_errors(vec!["kiwi build broke".into()]),
        )
        .await;

    let result = harness.next_result().await;
    assert_eq!(result.status, ResultStatus::Failed);
    assert!(result.errors[0].contains("build"));
    assert!(result.errors.contains(&"kiwi build broke".to_string()));

    harness.wait_for_status("fail-1", None).await;
    assert!(!job_file.exists());
    assert_eq!(harness.recording.runs(), 0);
    harness.stop().await;
}

#[tokio::test]
async fn upstream_delete_is_propagated() {
    let mut harness = Harness::start(Behaviour::Succeed, true).await;
    harness.announce(&stage_job("del-1", "always")).await;

    harness
        .upstream(JobResult::new("del-1", ResultStatus::Delete))
        .await;

    let result = harness.next_result().await;
    assert_eq!(result.status, ResultStatus::Delete);
    harness.wait_for_status("del-1", None).await;
    harness.stop().await;
}

#[tokio::test]
async fn recurring_job_survives_exceptions_and_runs_again() {
    let mut harness = Harness::start(Behaviour::Raise, true).await;
    harness.announce(&stage_job("always-1", "always")).await;

    harness
        .upstream(JobResult::new("always-1", ResultStatus::Success))
        .await;
    let first = harness.next_result().await;
    assert_eq!(first.status, ResultStatus::Exception);
    assert!(first.errors[0].contains("instance refused to boot"));
    harness
        .wait_for_status("always-1", Some(JobStatus::Queued))
        .await;
    assert_eq!(harness.runtime.iteration_count("always-1").await, Some(1));

    // A failing upstream cycle leaves the recurring job waiting.
    harness
        .upstream(JobResult::new("always-1", ResultStatus::Failed))
        .await;
    harness.wait_for_unacked("build.listener", 0).await;
    assert_eq!(
        harness.runtime.job_status("always-1").await,
        Some(JobStatus::Queued)
    );

    harness
        .upstream(JobResult::new("always-1", ResultStatus::Success))
        .await;
    let second = harness.next_result().await;
    assert_eq!(second.status, ResultStatus::Exception);
    harness
        .wait_for_status("always-1", Some(JobStatus::Queued))
        .await;
    assert_eq!(harness.runtime.iteration_count("always-1").await, Some(2));
    assert_eq!(harness.recording.runs(), 2);
    harness.stop().await;
}

#[tokio::test]
async fn deleting_twice_reports_unknown_job() {
    let tmp = tempfile::tempdir().unwrap();
    let broker = InMemoryBroker::new();
    let recording = Recording::new(Behaviour::Succeed, true);
    let runtime = runtime_for("test", &tmp, &broker, &recording).await;

    runtime
        .handle_new_job(stage_job("gone-1", "now"), None)
        .await
        .unwrap();
    let job_file = tmp.path().join("test").join("job-gone-1.json");
    assert!(job_file.exists());

    runtime.delete_job("gone-1").await.unwrap();
    assert!(!job_file.exists());
    assert!(runtime.job_status("gone-1").await.is_none());

    let err = runtime.delete_job("gone-1").await.unwrap_err();
    assert!(matches!(err, MashError::JobNotFound(id) if id == "gone-1"));
}

#[tokio::test]
async fn restart_restores_every_job_file_as_queued() {
    let tmp = tempfile::tempdir().unwrap();
    let store = JobStore::open(tmp.path().join("test")).await.unwrap();
    for id in ["r1", "r2", "r3"] {
        store.persist(&stage_job(id, "now")).await.unwrap();
    }

    let broker = InMemoryBroker::new();
    let recording = Recording::new(Behaviour::Succeed, true);
    let runtime = runtime_for("test", &tmp, &broker, &recording).await;

    assert_eq!(runtime.recover().await.unwrap(), 3);
    for id in ["r1", "r2", "r3"] {
        assert_eq!(runtime.job_status(id).await, Some(JobStatus::Queued));
    }
    assert_eq!(runtime.active_runs().await, 0);
    assert_eq!(recording.runs(), 0);
}

#[tokio::test]
async fn first_stage_runs_restored_jobs_once() {
    let tmp = tempfile::tempdir().unwrap();
    let store = JobStore::open(tmp.path().join("build")).await.unwrap();
    for id in ["b1", "b2"] {
        store.persist(&stage_job(id, "now")).await.unwrap();
    }

    let broker = InMemoryBroker::new();
    broker
        .bind_queue("build", LISTENER_MSG_KEY, "job_creator")
        .await
        .unwrap();
    let recording = Recording::new(Behaviour::Succeed, true);
    let runtime = runtime_for("build", &tmp, &broker, &recording).await;

    runtime.recover().await.unwrap();
    // Jobs are evicted before their result goes out.
    for _ in 0..500 {
        if broker.published_to("build").await.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(broker.published_to("build").await.len(), 2);
    assert!(runtime.tracked_ids().await.is_empty());
    assert_eq!(recording.runs(), 2);
}

#[tokio::test]
async fn run_interrupted_by_a_restart_is_redelivered_and_runs_once() {
    let harness = Harness::start(Behaviour::Succeed, false).await;
    harness.announce(&stage_job("crash-1", "now")).await;
    harness
        .upstream(JobResult::new("crash-1", ResultStatus::Success))
        .await;
    harness.wait_for_runs(1).await;
    harness.wait_for_unacked("build.listener", 1).await;
    let job_file = harness.tmp.path().join("test").join("job-crash-1.json");
    assert!(job_file.exists());

    // The first unit of work never finishes; the fresh runtime picks the job
    // up from its file and the redelivered upstream signal.
    let fresh = Recording::new(Behaviour::Succeed, true);
    let mut harness = harness.restart(Arc::clone(&fresh)).await;

    let result = harness.next_result().await;
    assert_eq!(result.id, "crash-1");
    assert_eq!(result.status, ResultStatus::Success);

    harness.wait_for_status("crash-1", None).await;
    harness.wait_for_unacked("build.listener", 0).await;
    harness.wait_for_idle().await;
    assert_eq!(fresh.runs(), 1);
    assert_eq!(harness.results_sent().await, 1);
    assert!(!job_file.exists());
    harness.stop().await;
}

#[tokio::test]
async fn deleting_a_running_job_discards_its_result() {
    let harness = Harness::start(Behaviour::Succeed, false).await;
    harness.announce(&stage_job("busy-1", "now")).await;
    harness
        .upstream(JobResult::new("busy-1", ResultStatus::Success))
        .await;
    harness.wait_for_status("busy-1", Some(JobStatus::Running)).await;
    harness.wait_for_runs(1).await;

    harness.delete("busy-1").await;
    harness.wait_for_status("busy-1", None).await;
    // The upstream signal is settled by the delete, not by the run.
    harness.wait_for_unacked("build.listener", 0).await;
    assert!(!harness.tmp.path().join("test").join("job-busy-1.json").exists());

    harness.recording.gate.add_permits(1_000);
    harness.wait_for_idle().await;
    assert_eq!(harness.recording.runs(), 1);
    assert_eq!(harness.results_sent().await, 0);
    assert!(harness.runtime.tracked_ids().await.is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn deleting_a_delayed_job_cancels_its_run() {
    let harness = Harness::start(Behaviour::Succeed, true).await;
    let later = (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
    harness.announce(&stage_job("later-1", &later)).await;
    harness
        .upstream(JobResult::new("later-1", ResultStatus::Success))
        .await;
    harness.wait_for_status("later-1", Some(JobStatus::Scheduled)).await;
    assert_eq!(harness.runtime.active_runs().await, 1);
    assert_eq!(harness.broker.unacked("build.listener").await, 1);

    harness.delete("later-1").await;
    harness.wait_for_status("later-1", None).await;
    harness.wait_for_unacked("build.listener", 0).await;
    harness.wait_for_idle().await;
    assert_eq!(harness.recording.runs(), 0);
    assert_eq!(harness.results_sent().await, 0);
    harness.stop().await;
}

#[tokio::test]
async fn announcement_with_unusable_id_is_acknowledged_and_dropped() {
    let harness = Harness::start(Behaviour::Succeed, true).await;
    let bad = stage_job("img.v1", "now");
    harness
        .broker
        .publish("test", JOB_DOCUMENT_KEY, &job_body("test", &bad).unwrap())
        .await
        .unwrap();
    // Announcements are handled in order, so once the next one is tracked the
    // rejected one has been settled.
    harness.announce(&stage_job("img-v1", "now")).await;

    harness.wait_for_unacked("test.service", 0).await;
    assert_eq!(harness.runtime.tracked_ids().await, vec!["img-v1".to_string()]);
    assert!(!harness.tmp.path().join("test").join("job-img.v1.json").exists());
    harness.stop().await;
}
