use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_stream::StreamMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::builder::MessageBuilders;
use super::status::{StatusSink, StatusUpdate};
use crate::broker::{Broker, Delivery, queue_name};
use crate::error::{MashError, Result};
use crate::job::{JobDocument, JobResult, ResultStatus, StageJob};
use crate::messages::{ServiceMessage, SubmissionMessage, delete_body, job_body};
use crate::notify::{self, Notification, NotificationPrefs, Notifier, should_notify};
use crate::stage::{JOB_CREATOR_EXCHANGE, JOB_DOCUMENT_KEY, LISTENER_MSG_KEY, ServiceOrder};

/// How a submission was handled.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubmitOutcome {
    /// Stage documents were published to these stages, in order.
    Accepted(Vec<String>),
    /// A job with this id is already in flight.
    Duplicate,
}

/// What the sequencer remembers about a job in flight.
#[derive(Clone, Debug)]
struct PipelineStatus {
    stages: Vec<String>,
    last_service: String,
    prefs: NotificationPrefs,
    target: String,
    /// Set once a failure has been reported for the current cycle.
    failure_notified: bool,
}

impl PipelineStatus {
    fn is_recurring(&self) -> bool {
        self.prefs.recurring
    }
}

struct Inner {
    order: ServiceOrder,
    broker: Arc<dyn Broker>,
    builders: MessageBuilders,
    sink: Arc<dyn StatusSink>,
    notifier: Option<Arc<dyn Notifier>>,
    jobs: Mutex<HashMap<String, PipelineStatus>>,
}

/// Pipeline sequencer ("job creator").
///
/// Fans a submitted job out to every stage it runs through, follows the
/// stage results to keep the persistence collaborator current, and decides
/// when the submitter is told about the outcome.
#[derive(Clone)]
pub struct JobCreator {
    inner: Arc<Inner>,
}

impl fmt::Debug for JobCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobCreator")
            .field("order", &self.inner.order)
            .field("builders", &self.inner.builders)
            .field("notifies", &self.inner.notifier.is_some())
            .finish()
    }
}

impl JobCreator {
    /// `notifier` is set when this deployment lets the sequencer send job
    /// notifications.
    pub fn new(
        order: ServiceOrder,
        broker: Arc<dyn Broker>,
        builders: MessageBuilders,
        sink: Arc<dyn StatusSink>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                order,
                broker,
                builders,
                sink,
                notifier,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Declares the submission queue plus one result queue per stage.
    pub async fn bind(&self) -> Result<Vec<String>> {
        let broker = &self.inner.broker;
        let mut queues = vec![
            broker
                .bind_queue(JOB_CREATOR_EXCHANGE, JOB_DOCUMENT_KEY, "service")
                .await?,
        ];
        for service in self.inner.order.services() {
            queues.push(
                broker
                    .bind_queue(service, LISTENER_MSG_KEY, "job_creator")
                    .await?,
            );
        }
        Ok(queues)
    }

    /// Binds its queues and handles messages until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut consumers = StreamMap::new();
        for queue in self.bind().await? {
            let consumer = self.inner.broker.consume(&queue).await?;
            consumers.insert(queue, consumer);
        }
        info!(stages = self.inner.order.len(), "job creator listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("job creator shutting down");
                    break;
                }
                next = consumers.next() => match next {
                    Some((_, delivery)) => self.handle_delivery(delivery).await,
                    None => {
                        warn!("all consumers closed");
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    pub async fn handle_delivery(&self, delivery: Delivery) {
        let handled = if delivery.queue == queue_name(JOB_CREATOR_EXCHANGE, "service") {
            match SubmissionMessage::parse(&delivery.body) {
                Ok(SubmissionMessage::Submit(doc)) => self.submit(*doc).await.map(|_| ()),
                Ok(SubmissionMessage::Delete(job_id)) => self.delete(&job_id).await.map(|_| ()),
                Err(err) => Err(err),
            }
        } else {
            match ServiceMessage::parse(&delivery.body) {
                Ok(ServiceMessage::Result { service, result }) => {
                    self.handle_result(&service, result).await.map(|_| ())
                }
                Ok(other) => Err(MashError::InvalidMessage(format!(
                    "unexpected message on {}: {other:?}",
                    delivery.queue
                ))),
                Err(err) => Err(err),
            }
        };
        if let Err(err) = handled {
            warn!(queue = %delivery.queue, error = %err, "message not processed");
        }

        let queue = delivery.queue.clone();
        if let Err(err) = delivery.ack().await {
            warn!(queue = %queue, error = %err, "failed to acknowledge delivery");
        }
    }

    /// Publishes one stage document per stage the job runs through.
    pub async fn submit(&self, doc: JobDocument) -> Result<SubmitOutcome> {
        let inner = &self.inner;
        doc.validate(&inner.order)?;
        let stages = inner.order.through(&doc.last_service)?.to_vec();

        let builder = inner.builders.for_cloud(doc.cloud);
        let documents = stages
            .iter()
            .map(|service| builder.build(service, &doc).map(|job| (service.clone(), job)))
            .collect::<Result<Vec<(String, StageJob)>>>()?;

        {
            let mut jobs = inner.jobs.lock().await;
            if jobs.contains_key(&doc.id) {
                warn!(job_id = %doc.id, "job already in flight, ignoring submission");
                return Ok(SubmitOutcome::Duplicate);
            }
            jobs.insert(
                doc.id.clone(),
                PipelineStatus {
                    stages: stages.clone(),
                    last_service: doc.last_service.clone(),
                    prefs: doc.notification_prefs(),
                    target: doc.display_target(),
                    failure_notified: false,
                },
            );
        }

        for (idx, (service, job)) in documents.iter().enumerate() {
            let published = match job_body(service, job) {
                Ok(body) => inner.broker.publish(service, JOB_DOCUMENT_KEY, &body).await,
                Err(err) => Err(err),
            };
            if let Err(err) = published {
                error!(job_id = %doc.id, service = %service, error = %err, "failed to publish stage job");
                // Forget the submission and withdraw it from the stages that
                // already have it, so the same id can be submitted again.
                inner.jobs.lock().await.remove(&doc.id);
                self.withdraw(&doc.id, &stages[..idx]).await;
                return Err(err);
            }
            debug!(job_id = %doc.id, service = %service, "stage job published");
        }
        info!(job_id = %doc.id, stages = ?stages, "job submitted");

        self.forward(&StatusUpdate::queued(&doc.id, inner.order.first()))
            .await;
        Ok(SubmitOutcome::Accepted(stages))
    }

    /// Records a stage result, forwards it to persistence and notifies the
    /// submitter when the gate says so.
    pub async fn handle_result(&self, service: &str, result: JobResult) -> Result<StatusUpdate> {
        let inner = &self.inner;
        if !inner.order.contains(service) {
            return Err(MashError::InvalidMessage(format!(
                "result from unknown stage `{service}`"
            )));
        }

        let mut notification = None;
        let update = {
            let mut jobs = inner.jobs.lock().await;
            match jobs.get_mut(&result.id) {
                None => {
                    warn!(job_id = %result.id, service, "result for a job not in flight");
                    StatusUpdate::from_result(&result, service, inner.order.next(service))
                }
                Some(pipeline) => {
                    let next = inner.order.next_within(service, &pipeline.last_service);
                    let update = StatusUpdate::from_result(&result, service, next);

                    if pipeline.stages.first().is_some_and(|first| first == service) {
                        pipeline.failure_notified = false;
                    }
                    let repeat_failure = result.status.is_failure() && pipeline.failure_notified;
                    if result.status != ResultStatus::Delete
                        && !repeat_failure
                        && should_notify(&pipeline.prefs, result.status, service, &pipeline.last_service)
                    {
                        notification = Notification::compose(
                            &pipeline.prefs,
                            &result.id,
                            &pipeline.target,
                            service,
                            result.status,
                            &result.errors,
                        );
                    }
                    if result.status.is_failure() && notification.is_some() {
                        pipeline.failure_notified = true;
                    }

                    let terminal = service == pipeline.last_service;
                    if result.status == ResultStatus::Delete
                        || (terminal && !pipeline.is_recurring())
                    {
                        jobs.remove(&result.id);
                        debug!(job_id = %result.id, "job left the pipeline");
                    }
                    update
                }
            }
        };

        info!(
            job_id = %update.id,
            prev_service = service,
            current_service = ?update.current_service,
            status = %update.status,
            "stage reported"
        );
        self.forward(&update).await;
        if let (Some(notifier), Some(notification)) = (&inner.notifier, notification) {
            notify::deliver(notifier.as_ref(), &update.id, &notification).await;
        }
        Ok(update)
    }

    /// Sends a delete directive to every stage of the job and forgets it.
    /// Returns the number of stages reached.
    pub async fn delete(&self, job_id: &str) -> Result<usize> {
        let inner = &self.inner;
        let stages = match inner.jobs.lock().await.remove(job_id) {
            Some(pipeline) => pipeline.stages,
            None => {
                warn!(job_id, "deleting a job not in flight, notifying every stage");
                inner.order.services().to_vec()
            }
        };

        let reached = self.withdraw(job_id, &stages).await;
        info!(job_id, reached, "job delete requested");
        Ok(reached)
    }

    /// Publishes a delete directive to each of `stages`. Returns how many
    /// were published.
    async fn withdraw(&self, job_id: &str, stages: &[String]) -> usize {
        let mut reached = 0;
        for service in stages {
            match self
                .inner
                .broker
                .publish(service, JOB_DOCUMENT_KEY, &delete_body(service, job_id))
                .await
            {
                Ok(()) => reached += 1,
                Err(err) => {
                    error!(job_id, service = %service, error = %err, "failed to publish delete")
                }
            }
        }
        reached
    }

    /// True while the sequencer tracks `job_id`.
    pub async fn in_flight(&self, job_id: &str) -> bool {
        self.inner.jobs.lock().await.contains_key(job_id)
    }

    async fn forward(&self, update: &StatusUpdate) {
        if let Err(err) = self.inner.sink.update(update).await {
            warn!(job_id = %update.id, error = %err, "failed to forward job status");
        }
    }
}
