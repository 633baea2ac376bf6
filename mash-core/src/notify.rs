//! Notification gate: decides whether a job outcome should be mailed to the
//! submitter and builds the message. Delivery itself belongs to an external
//! mailer reached through a [`Notifier`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::error::{MashError, Result};
use crate::job::ResultStatus;
use crate::stage::NOTIFICATION_EXCHANGE;

/// Routing key the external mailer listens on.
pub const EMAIL_ROUTING_KEY: &str = "email";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    /// Notify once, when the job finishes or fails.
    #[default]
    Single,
    /// Notify after every stage.
    Periodic,
}

/// Notification preferences extracted from a job.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotificationPrefs {
    pub email: Option<String>,
    pub kind: NotificationType,
    pub recurring: bool,
}

/// Gate for job notifications.
///
/// Fires when an address is configured and either the outcome is not a
/// success, the job asked for periodic updates, or the reporting stage is the
/// job's last one. Recurring ("always") jobs only ever notify on failure.
pub fn should_notify(
    prefs: &NotificationPrefs,
    status: ResultStatus,
    service: &str,
    last_service: &str,
) -> bool {
    let has_email = prefs
        .email
        .as_deref()
        .is_some_and(|email| !email.trim().is_empty());
    if !has_email {
        return false;
    }
    !status.is_success()
        || (prefs.kind == NotificationType::Periodic && !prefs.recurring)
        || (service == last_service && !prefs.recurring)
}

/// Message handed to the external mailer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    /// Builds a notification for `job_id`, or `None` when no address is set.
    pub fn compose(
        prefs: &NotificationPrefs,
        job_id: &str,
        target: &str,
        service: &str,
        status: ResultStatus,
        errors: &[String],
    ) -> Option<Self> {
        let to = prefs.email.clone()?;
        let outcome = match status {
            ResultStatus::Success => "succeeded",
            ResultStatus::Failed => "failed",
            ResultStatus::Exception => "failed with an exception",
            ResultStatus::Delete => "was deleted",
        };
        let subject = format!("Job {job_id} {outcome}");
        let mut body = format!(
            "Job {job_id} for {target} {outcome} in the {service} stage."
        );
        if !status.is_success() && !errors.is_empty() {
            body.push_str("\n\nErrors:\n");
            for error in errors {
                body.push_str("  - ");
                body.push_str(error);
                body.push('\n');
            }
        }
        Some(Self { to, subject, body })
    }
}

/// Delivery channel for notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Sends `notification` and logs delivery failures instead of returning them.
pub async fn deliver(notifier: &dyn Notifier, job_id: &str, notification: &Notification) {
    if let Err(err) = notifier.send(notification).await {
        warn!(job_id, error = %err, "failed to send job notification");
    }
}

/// Publishes notifications for the external mailer.
pub struct BrokerNotifier {
    broker: Arc<dyn Broker>,
}

impl fmt::Debug for BrokerNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerNotifier")
            .field("exchange", &NOTIFICATION_EXCHANGE)
            .finish()
    }
}

impl BrokerNotifier {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Notifier for BrokerNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let body = json!({ "email_notification": notification }).to_string();
        self.broker
            .publish(NOTIFICATION_EXCHANGE, EMAIL_ROUTING_KEY, &body)
            .await
            .map_err(|err| {
                MashError::Notification(format!("mail to {} not queued: {err}", notification.to))
            })
    }
}

/// Writes notifications to the log; used when no mailer is deployed.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            to = %notification.to,
            subject = %notification.subject,
            "job notification"
        );
        Ok(())
    }
}
