use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_stream::StreamMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::credentials::{Credentials, CredentialsClient, CredentialsResponse};
use super::scheduler::{JobScheduler, Removal};
use super::worker::{JobObserver, StageWorkerFactory, TracingObserver, WorkOutcome, WorkerContext};
use crate::broker::{Broker, Delivery};
use crate::error::{MashError, Result};
use crate::job::{JobResult, JobStatus, ResultStatus, StageJob};
use crate::messages::{ServiceMessage, result_body};
use crate::notify::{self, Notification, Notifier, should_notify};
use crate::stage::{JOB_DOCUMENT_KEY, LISTENER_MSG_KEY, ServiceOrder};
use crate::store::JobStore;

/// Settings for one stage runtime.
#[derive(Clone, Debug)]
pub struct StageRuntimeConfig {
    /// Stage served by this runtime.
    pub service: String,
    pub order: ServiceOrder,
    /// Directory holding this stage's job files.
    pub job_directory: PathBuf,
    /// Concurrent units of work.
    pub max_workers: usize,
    /// Wait before asking for credentials again.
    pub credentials_retry: Duration,
    /// Pause between runs of a recurring job on the first stage, which has
    /// no upstream signal to wait for.
    pub recurring_interval: Duration,
}

/// How a new-job announcement was handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NewJobOutcome {
    /// Tracked and waiting for the upstream stage.
    Queued,
    /// Tracked and handed to the scheduler (first stage of the order).
    Scheduled,
    /// Already tracked; nothing changed.
    Duplicate,
}

/// How an upstream completion signal was handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalOutcome {
    /// Handed to the scheduler.
    Scheduled,
    /// A run for the job is already pending or in progress.
    AlreadyScheduled,
    /// Job was deleted and the outcome sent downstream.
    Deleted,
    /// Recurring job stays queued for the next cycle.
    Waiting,
    /// No tracked job has this id.
    Untracked,
}

/// A job tracked by this stage.
pub struct JobRecord {
    pub job: StageJob,
    pub status: JobStatus,
    /// Completed runs.
    pub iteration_count: u32,
    /// Where the job description is persisted.
    pub job_file: PathBuf,
    credentials: Option<Credentials>,
    /// Upstream delivery acknowledged once the scheduled run completes.
    pending: Option<Delivery>,
    cancel: CancellationToken,
}

impl fmt::Debug for JobRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRecord")
            .field("job_id", &self.job.id)
            .field("status", &self.status)
            .field("iteration_count", &self.iteration_count)
            .field("job_file", &self.job_file)
            .field("has_credentials", &self.credentials.is_some())
            .field("pending_ack", &self.pending.is_some())
            .finish()
    }
}

struct Inner {
    service: String,
    order: ServiceOrder,
    recurring_interval: Duration,
    broker: Arc<dyn Broker>,
    store: JobStore,
    scheduler: JobScheduler,
    factory: Arc<dyn StageWorkerFactory>,
    credentials: CredentialsClient,
    observer: Arc<dyn JobObserver>,
    notifier: Option<Arc<dyn Notifier>>,
    jobs: Mutex<HashMap<String, JobRecord>>,
}

/// Stage runtime ("listener"): tracks this stage's jobs, runs each one when
/// its upstream stage reports success, and publishes the result downstream.
#[derive(Clone)]
pub struct StageRuntime {
    inner: Arc<Inner>,
}

impl fmt::Debug for StageRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRuntime")
            .field("service", &self.inner.service)
            .field("order", &self.inner.order)
            .field("scheduler", &self.inner.scheduler)
            .field("notifies", &self.inner.notifier.is_some())
            .finish()
    }
}

impl StageRuntime {
    /// Opens the job directory and wires the runtime. `notifier` is set when
    /// this deployment lets stage runtimes send job notifications.
    pub async fn new(
        config: StageRuntimeConfig,
        broker: Arc<dyn Broker>,
        factory: Arc<dyn StageWorkerFactory>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Result<Self> {
        if !config.order.contains(&config.service) {
            return Err(MashError::InvalidJob(format!(
                "service `{}` is not part of the stage order {:?}",
                config.service,
                config.order.services()
            )));
        }
        let store = JobStore::open(&config.job_directory).await?;
        let credentials = CredentialsClient::new(
            Arc::clone(&broker),
            config.service.clone(),
            config.credentials_retry,
        );
        let observer: Arc<dyn JobObserver> = Arc::new(TracingObserver::new(&config.service));
        Ok(Self {
            inner: Arc::new(Inner {
                service: config.service,
                order: config.order,
                recurring_interval: config.recurring_interval,
                broker,
                store,
                scheduler: JobScheduler::new(config.max_workers),
                factory,
                credentials,
                observer,
                notifier,
                jobs: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Name of the stage this runtime serves.
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    fn upstream(&self) -> Option<&str> {
        self.inner.order.previous(&self.inner.service)
    }

    /// Declares this stage's queues and returns their names.
    pub async fn bind(&self) -> Result<Vec<String>> {
        let service = &self.inner.service;
        let broker = &self.inner.broker;
        let mut queues = vec![broker.bind_queue(service, JOB_DOCUMENT_KEY, "service").await?];
        if let Some(upstream) = self.upstream() {
            queues.push(broker.bind_queue(upstream, LISTENER_MSG_KEY, "listener").await?);
        }
        queues.push(self.inner.credentials.bind().await?);
        Ok(queues)
    }

    /// Replays every job file through the new-job path. Returns the number of
    /// jobs tracked afterwards.
    pub async fn recover(&self) -> Result<usize> {
        let jobs = self.inner.store.load_all().await?;
        let found = jobs.len();
        for job in jobs {
            let job_id = job.id.clone();
            if let Err(err) = self.handle_new_job(job, None).await {
                warn!(job_id = %job_id, error = %err, "failed to restore job");
            }
        }
        let tracked = self.inner.jobs.lock().await.len();
        info!(service = %self.inner.service, found, tracked, "job directory restored");
        Ok(tracked)
    }

    /// Binds, restores, then handles messages until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let queues = self.bind().await?;
        self.recover().await?;

        let mut consumers = StreamMap::new();
        for queue in queues {
            let consumer = self.inner.broker.consume(&queue).await?;
            consumers.insert(queue, consumer);
        }
        info!(service = %self.inner.service, "stage runtime listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(service = %self.inner.service, "stage runtime shutting down");
                    break;
                }
                next = consumers.next() => match next {
                    Some((_, delivery)) => self.handle_delivery(delivery).await,
                    None => {
                        warn!(service = %self.inner.service, "all consumers closed");
                        break;
                    }
                },
            }
        }
        self.inner.scheduler.shutdown();
        Ok(())
    }

    /// Dispatches one inbound message. Every branch either acknowledges the
    /// delivery or hands it to a scheduled run.
    pub async fn handle_delivery(&self, delivery: Delivery) {
        if delivery.routing_key == self.inner.credentials.response_key() {
            match CredentialsResponse::parse(&delivery.body) {
                Ok(response) => {
                    self.inner.credentials.deliver(response).await;
                }
                Err(err) => warn!(queue = %delivery.queue, error = %err, "dropping credentials message"),
            }
            ack(delivery).await;
            return;
        }

        let message = match ServiceMessage::parse(&delivery.body) {
            Ok(message) => message,
            Err(err) => {
                warn!(queue = %delivery.queue, error = %err, "dropping unreadable message");
                ack(delivery).await;
                return;
            }
        };

        match message {
            ServiceMessage::NewJob { service, job } if service == self.inner.service => {
                let job_id = job.id.clone();
                if let Err(err) = self.handle_new_job(job, Some(delivery)).await {
                    warn!(job_id = %job_id, error = %err, "new job not tracked");
                }
            }
            ServiceMessage::Delete { service, job_id } if service == self.inner.service => {
                match self.delete_job(&job_id).await {
                    Ok(()) => {}
                    Err(MashError::JobNotFound(_)) => {
                        warn!(job_id = %job_id, "delete requested for unknown job")
                    }
                    Err(err) => warn!(job_id = %job_id, error = %err, "delete failed"),
                }
                ack(delivery).await;
            }
            ServiceMessage::Result { service, result } if Some(service.as_str()) == self.upstream() => {
                self.handle_upstream_result(result, delivery).await;
            }
            other => {
                warn!(queue = %delivery.queue, message = ?other, "message not addressed to this stage");
                ack(delivery).await;
            }
        }
    }

    /// Starts tracking `job`. The announcement is acknowledged once the job
    /// file is written, or right away when the job is rejected or known.
    pub async fn handle_new_job(
        &self,
        job: StageJob,
        delivery: Option<Delivery>,
    ) -> Result<NewJobOutcome> {
        let inner = &self.inner;
        if let Err(err) = job
            .validate(&inner.order, &inner.service)
            .and_then(|()| inner.factory.validate(&job))
        {
            warn!(job_id = %job.id, error = %err, "dropping invalid job");
            ack_opt(delivery).await;
            return Err(err);
        }

        let job_id = job.id.clone();
        {
            let mut jobs = inner.jobs.lock().await;
            if jobs.contains_key(&job_id) {
                drop(jobs);
                warn!(job_id = %job_id, "job already tracked, ignoring announcement");
                ack_opt(delivery).await;
                return Ok(NewJobOutcome::Duplicate);
            }

            // File and record appear together under the table lock. A failed
            // write leaves the announcement unacknowledged for redelivery.
            let job_file = inner.store.persist(&job).await?;
            jobs.insert(
                job_id.clone(),
                JobRecord {
                    job,
                    status: JobStatus::Queued,
                    iteration_count: 0,
                    job_file,
                    credentials: None,
                    pending: None,
                    cancel: CancellationToken::new(),
                },
            );
        }
        ack_opt(delivery).await;
        info!(job_id = %job_id, service = %inner.service, "job queued");

        if inner.order.is_first(&inner.service) {
            return match self.schedule(&job_id, None, None).await {
                SignalOutcome::Scheduled => Ok(NewJobOutcome::Scheduled),
                _ => Ok(NewJobOutcome::Queued),
            };
        }
        Ok(NewJobOutcome::Queued)
    }

    /// Applies an upstream stage's result to the tracked job.
    pub async fn handle_upstream_result(&self, result: JobResult, delivery: Delivery) -> SignalOutcome {
        let recurring = {
            let jobs = self.inner.jobs.lock().await;
            jobs.get(&result.id).map(|record| record.job.is_recurring())
        };
        let Some(recurring) = recurring else {
            warn!(job_id = %result.id, status = %result.status, "result for untracked job");
            ack(delivery).await;
            return SignalOutcome::Untracked;
        };

        match result.status {
            ResultStatus::Success => self.schedule(&result.id, Some(delivery), None).await,
            ResultStatus::Delete => {
                self.delete_quietly(&result.id).await;
                self.publish_result(&JobResult::new(&result.id, ResultStatus::Delete))
                    .await;
                ack(delivery).await;
                SignalOutcome::Deleted
            }
            ResultStatus::Failed | ResultStatus::Exception if recurring => {
                info!(
                    job_id = %result.id,
                    status = %result.status,
                    "upstream failed, recurring job waits for the next cycle"
                );
                ack(delivery).await;
                SignalOutcome::Waiting
            }
            ResultStatus::Failed | ResultStatus::Exception => {
                let upstream = self.upstream().unwrap_or("upstream");
                let mut errors = vec![format!("{upstream} stage reported {}", result.status)];
                errors.extend(result.errors.iter().cloned());
                self.delete_quietly(&result.id).await;
                self.publish_result(
                    &JobResult::new(&result.id, ResultStatus::Failed).with_errors(errors),
                )
                .await;
                ack(delivery).await;
                SignalOutcome::Deleted
            }
        }
    }

    /// Hands the job to the scheduler. `not_before` overrides the job's own
    /// start time.
    ///
    /// Returns a boxed future: a finished recurring run schedules its next
    /// run, so the run and schedule futures would otherwise contain each other.
    fn schedule<'a>(
        &'a self,
        job_id: &'a str,
        delivery: Option<Delivery>,
        not_before: Option<chrono::DateTime<Utc>>,
    ) -> BoxFuture<'a, SignalOutcome> {
        Box::pin(self.schedule_run(job_id, delivery, not_before))
    }

    async fn schedule_run(
        &self,
        job_id: &str,
        delivery: Option<Delivery>,
        not_before: Option<chrono::DateTime<Utc>>,
    ) -> SignalOutcome {
        let mut jobs = self.inner.jobs.lock().await;
        let Some(record) = jobs.get_mut(job_id) else {
            drop(jobs);
            ack_opt(delivery).await;
            return SignalOutcome::Untracked;
        };
        let run_at = not_before.or_else(|| record.job.utctime.run_at());
        let runtime = self.clone();
        let id = job_id.to_string();
        let task = async move { runtime.run_job(&id).await };
        // The table lock is held across scheduling so the run cannot observe
        // the record before its pending delivery is attached.
        match self.inner.scheduler.schedule(job_id, run_at, task).await {
            Ok(()) => {
                record.status = JobStatus::Scheduled;
                record.pending = delivery;
                debug!(job_id, "job scheduled");
                SignalOutcome::Scheduled
            }
            Err(err) => {
                drop(jobs);
                warn!(job_id, error = %err, "job not scheduled");
                ack_opt(delivery).await;
                SignalOutcome::AlreadyScheduled
            }
        }
    }

    async fn run_job(&self, job_id: &str) {
        let inner = &self.inner;
        let claimed = {
            let mut jobs = inner.jobs.lock().await;
            jobs.get_mut(job_id).map(|record| {
                record.status = JobStatus::Running;
                (
                    record.job.clone(),
                    record.job_file.clone(),
                    record.iteration_count,
                    record.credentials.clone(),
                    record.cancel.clone(),
                )
            })
        };
        let Some((job, job_file, iteration, cached, cancel)) = claimed else {
            inner.scheduler.release(job_id).await;
            return;
        };
        info!(job_id, service = %inner.service, iteration, "running job");

        let credentials = match (job.cloud_accounts.is_empty(), cached) {
            (true, _) => None,
            (false, Some(credentials)) => Some(credentials),
            (false, None) => {
                match inner
                    .credentials
                    .obtain(job_id, &job.cloud_accounts, &cancel)
                    .await
                {
                    Ok(credentials) => {
                        if let Some(record) = inner.jobs.lock().await.get_mut(job_id) {
                            record.credentials = Some(credentials.clone());
                        }
                        Some(credentials)
                    }
                    Err(err) => {
                        self.credentials_failed(job_id, err).await;
                        return;
                    }
                }
            }
        };

        let ctx = WorkerContext {
            service: inner.service.clone(),
            job,
            job_file,
            iteration,
            credentials,
            observer: Arc::clone(&inner.observer),
        };
        let outcome = match inner.factory.build(ctx) {
            Ok(mut worker) => match tokio::spawn(async move { worker.run().await }).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => WorkOutcome::exception(err.to_string()),
                Err(err) => WorkOutcome::exception(format!("unit of work panicked: {err}")),
            },
            Err(err) => WorkOutcome::exception(format!("unit of work not built: {err}")),
        };

        self.finish_job(job_id, outcome).await;
    }

    /// Settles a run that ended without credentials. A cancelled wait means
    /// the job was deleted; any other error is reported as an exception so
    /// the upstream delivery is acknowledged and the status moves on.
    async fn credentials_failed(&self, job_id: &str, err: MashError) {
        if let MashError::Cancelled(_) = err {
            info!(job_id, "job left before credentials arrived");
            self.inner.scheduler.release(job_id).await;
            return;
        }
        error!(job_id, error = %err, "credentials not obtained");
        let outcome = WorkOutcome::exception(format!("credentials not obtained: {err}"));
        self.finish_job(job_id, outcome).await;
    }

    async fn finish_job(&self, job_id: &str, outcome: WorkOutcome) {
        let inner = &self.inner;
        let result = JobResult {
            id: job_id.to_string(),
            status: outcome.status,
            errors: outcome.errors,
            fields: outcome.fields,
        };

        let finished = {
            let mut jobs = inner.jobs.lock().await;
            match jobs.get_mut(job_id) {
                None => None,
                Some(record) => {
                    record.iteration_count += 1;
                    record.status = result.status.into();
                    let pending = record.pending.take();
                    let prefs = record.job.notification_prefs();
                    let last_service = record.job.last_service.clone();
                    let target = record.job.display_target();
                    let recurring = record.job.is_recurring();
                    if recurring {
                        record.status = JobStatus::Reported;
                    } else {
                        jobs.remove(job_id);
                        if let Err(err) = inner.store.remove(job_id).await {
                            warn!(job_id, error = %err, "failed to remove job file");
                        }
                    }
                    Some((pending, prefs, last_service, target, recurring))
                }
            }
        };

        let Some((pending, prefs, last_service, target, recurring)) = finished else {
            info!(job_id, status = %result.status, "job deleted while running, discarding result");
            inner.scheduler.release(job_id).await;
            return;
        };

        info!(job_id, service = %inner.service, status = %result.status, "job finished");
        self.publish_result(&result).await;

        if let Some(record) = inner.jobs.lock().await.get_mut(job_id)
            && record.status == JobStatus::Reported
        {
            record.status = JobStatus::Queued;
        }

        if let Some(notifier) = &inner.notifier
            && should_notify(&prefs, result.status, &inner.service, &last_service)
            && let Some(notification) = Notification::compose(
                &prefs,
                job_id,
                &target,
                &inner.service,
                result.status,
                &result.errors,
            )
        {
            notify::deliver(notifier.as_ref(), job_id, &notification).await;
        }

        inner.scheduler.release(job_id).await;
        ack_opt(pending).await;

        if recurring && inner.order.is_first(&inner.service) {
            let next = chrono::Duration::from_std(inner.recurring_interval)
                .ok()
                .and_then(|interval| Utc::now().checked_add_signed(interval));
            debug!(job_id, next_run = ?next, "recurring job rescheduled");
            self.schedule(job_id, None, next).await;
        }
    }

    async fn publish_result(&self, result: &JobResult) {
        let service = &self.inner.service;
        let body = match result_body(service, result) {
            Ok(body) => body,
            Err(err) => {
                error!(job_id = %result.id, error = %err, "failed to encode job result");
                return;
            }
        };
        if let Err(err) = self
            .inner
            .broker
            .publish(service, LISTENER_MSG_KEY, &body)
            .await
        {
            error!(job_id = %result.id, error = %err, "failed to publish job result");
        }
    }

    async fn delete_quietly(&self, job_id: &str) {
        if let Err(err) = self.delete_job(job_id).await {
            debug!(job_id, error = %err, "job already gone");
        }
    }

    /// Stops tracking `job_id`: cancels a pending run, removes the job file
    /// and acknowledges a deferred delivery. A running unit of work finishes
    /// and its result is discarded.
    pub async fn delete_job(&self, job_id: &str) -> Result<()> {
        let inner = &self.inner;
        let record = {
            let mut jobs = inner.jobs.lock().await;
            let record = jobs
                .remove(job_id)
                .ok_or_else(|| MashError::JobNotFound(job_id.to_string()))?;
            if let Err(err) = inner.store.remove(job_id).await {
                warn!(job_id, error = %err, "failed to remove job file");
            }
            record
        };
        record.cancel.cancel();

        match inner.scheduler.remove(job_id).await {
            Removal::Cancelled => debug!(job_id, "pending run cancelled"),
            Removal::Running => info!(job_id, "job is running, its result will be discarded"),
            Removal::NotFound => {}
        }
        ack_opt(record.pending).await;
        info!(job_id, service = %inner.service, "job deleted");
        Ok(())
    }

    /// Status of a tracked job; `None` once it is no longer tracked.
    pub async fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.inner
            .jobs
            .lock()
            .await
            .get(job_id)
            .map(|record| record.status)
    }

    /// Completed runs of a tracked job.
    pub async fn iteration_count(&self, job_id: &str) -> Option<u32> {
        self.inner
            .jobs
            .lock()
            .await
            .get(job_id)
            .map(|record| record.iteration_count)
    }

    /// Ids of tracked jobs, sorted.
    pub async fn tracked_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.jobs.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of runs pending or in progress.
    pub async fn active_runs(&self) -> usize {
        self.inner.scheduler.len().await
    }
}

async fn ack(delivery: Delivery) {
    let queue = delivery.queue.clone();
    if let Err(err) = delivery.ack().await {
        warn!(queue = %queue, error = %err, "failed to acknowledge delivery");
    }
}

async fn ack_opt(delivery: Option<Delivery>) {
    if let Some(delivery) = delivery {
        ack(delivery).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::listener::worker::StageWorker;
    use serde_json::json;

    struct Unbuildable;

    impl StageWorkerFactory for Unbuildable {
        fn build(&self, _ctx: WorkerContext) -> Result<Box<dyn StageWorker>> {
            Err(MashError::Internal("no unit of work in this test".into()))
        }
    }

    #[tokio::test]
    async fn failed_credential_wait_reports_exception_and_acks() {
        let tmp = tempfile::tempdir().unwrap();
        let broker = InMemoryBroker::new();
        broker
            .bind_queue("test", LISTENER_MSG_KEY, "job_creator")
            .await
            .unwrap();
        let upstream = broker
            .bind_queue("build", LISTENER_MSG_KEY, "listener")
            .await
            .unwrap();
        let mut signals = broker.consume(&upstream).await.unwrap();

        let runtime = StageRuntime::new(
            StageRuntimeConfig {
                service: "test".into(),
                order: ServiceOrder::new(["build", "test", "publish"]).unwrap(),
                job_directory: tmp.path().join("test"),
                max_workers: 1,
                credentials_retry: Duration::from_millis(50),
                recurring_interval: Duration::from_secs(3600),
            },
            Arc::new(broker.clone()),
            Arc::new(Unbuildable),
            None,
        )
        .await
        .unwrap();

        let job: StageJob = serde_json::from_value(json!({
            "id": "cred-1",
            "utctime": "now",
            "last_service": "publish",
            "cloud_accounts": ["acct1"]
        }))
        .unwrap();
        runtime.handle_new_job(job, None).await.unwrap();

        broker
            .publish("build", LISTENER_MSG_KEY, "{\"listener_msg\":{}}")
            .await
            .unwrap();
        let delivery = signals.next().await.unwrap();
        {
            let mut jobs = runtime.inner.jobs.lock().await;
            let record = jobs.get_mut("cred-1").unwrap();
            record.status = JobStatus::Running;
            record.pending = Some(delivery);
        }
        assert_eq!(broker.unacked(&upstream).await, 1);

        runtime
            .credentials_failed("cred-1", MashError::Broker("credentials exchange gone".into()))
            .await;

        assert_eq!(broker.unacked(&upstream).await, 0);
        assert_eq!(runtime.job_status("cred-1").await, None);
        let published = broker.published_to("test").await;
        assert_eq!(published.len(), 1);
        match ServiceMessage::parse(&published[0].body).unwrap() {
            ServiceMessage::Result { result, .. } => {
                assert_eq!(result.status, ResultStatus::Exception);
                assert!(result.errors[0].contains("credentials not obtained"));
            }
            other => panic!("expected a stage result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_credential_wait_leaves_the_record_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let broker = InMemoryBroker::new();
        let runtime = StageRuntime::new(
            StageRuntimeConfig {
                service: "build".into(),
                order: ServiceOrder::new(["build", "test"]).unwrap(),
                job_directory: tmp.path().join("build"),
                max_workers: 1,
                credentials_retry: Duration::from_millis(50),
                recurring_interval: Duration::from_secs(3600),
            },
            Arc::new(broker.clone()),
            Arc::new(Unbuildable),
            None,
        )
        .await
        .unwrap();

        runtime
            .credentials_failed("gone-1", MashError::Cancelled("credential wait".into()))
            .await;
        assert!(broker.published().await.is_empty());
        assert_eq!(runtime.active_runs().await, 0);
    }
}
