use std::fmt;
use std::sync::Arc;

use crate::error::{MashError, Result};

/// Routing key carrying new work (job documents and delete directives).
pub const JOB_DOCUMENT_KEY: &str = "job_document";
/// Routing key carrying stage results.
pub const LISTENER_MSG_KEY: &str = "listener_msg";

/// Exchange owned by the pipeline sequencer.
pub const JOB_CREATOR_EXCHANGE: &str = "jobcreator";
/// Exchange used for credential requests and responses.
pub const CREDENTIALS_EXCHANGE: &str = "credentials";
/// Exchange consumed by the external mailer.
pub const NOTIFICATION_EXCHANGE: &str = "notification";

/// Exchange names that can never be used as a stage name.
pub const RESERVED_EXCHANGES: [&str; 3] =
    [JOB_CREATOR_EXCHANGE, CREDENTIALS_EXCHANGE, NOTIFICATION_EXCHANGE];

/// The total order of pipeline stages for one deployment.
///
/// Every component derives "next" and "previous" stage from this order; it is
/// never inferred from message content.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceOrder {
    services: Arc<[String]>,
}

impl fmt::Debug for ServiceOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.services.iter()).finish()
    }
}

impl ServiceOrder {
    /// Builds an order from stage names. Rejects an empty order, blank or
    /// reserved names and repeats.
    pub fn new<I, S>(services: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let services: Vec<String> = services.into_iter().map(Into::into).collect();
        if services.is_empty() {
            return Err(MashError::Internal("service order is empty".into()));
        }
        for (idx, name) in services.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(MashError::Internal(format!(
                    "service order entry {idx} is blank"
                )));
            }
            if RESERVED_EXCHANGES.contains(&name.as_str()) {
                return Err(MashError::Internal(format!(
                    "`{name}` is reserved and cannot be a service name"
                )));
            }
            if services[..idx].contains(name) {
                return Err(MashError::Internal(format!(
                    "service `{name}` appears more than once"
                )));
            }
        }
        Ok(Self {
            services: services.into(),
        })
    }

    /// Stage names in pipeline order.
    pub fn services(&self) -> &[String] {
        &self.services
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Always `false` for an order built through [`ServiceOrder::new`].
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Zero-based index of `service`.
    pub fn position(&self, service: &str) -> Option<usize> {
        self.services.iter().position(|s| s == service)
    }

    /// True when `service` is part of the order.
    pub fn contains(&self, service: &str) -> bool {
        self.position(service).is_some()
    }

    /// The stage with no upstream.
    pub fn first(&self) -> &str {
        &self.services[0]
    }

    /// True when `service` is the first stage.
    pub fn is_first(&self, service: &str) -> bool {
        self.first() == service
    }

    /// Upstream stage of `service`, if it has one.
    pub fn previous(&self, service: &str) -> Option<&str> {
        let idx = self.position(service)?;
        idx.checked_sub(1).map(|prev| self.services[prev].as_str())
    }

    /// Downstream stage of `service`, if it has one.
    pub fn next(&self, service: &str) -> Option<&str> {
        let idx = self.position(service)?;
        self.services.get(idx + 1).map(String::as_str)
    }

    /// Stage following `service` for a job cut off at `last_service`.
    ///
    /// `None` when `service` is the job's last stage or lies outside the job's
    /// range.
    pub fn next_within(&self, service: &str, last_service: &str) -> Option<&str> {
        let idx = self.position(service)?;
        let last = self.position(last_service)?;
        if idx >= last {
            return None;
        }
        self.services.get(idx + 1).map(String::as_str)
    }

    /// All stages from the first one through `last_service`, inclusive.
    pub fn through(&self, last_service: &str) -> Result<&[String]> {
        let last = self.position(last_service).ok_or_else(|| {
            MashError::InvalidJob(format!("unknown last_service `{last_service}`"))
        })?;
        Ok(&self.services[..=last])
    }

    /// True when `service` runs for a job cut off at `last_service`.
    pub fn includes(&self, service: &str, last_service: &str) -> bool {
        match (self.position(service), self.position(last_service)) {
            (Some(idx), Some(last)) => idx <= last,
            _ => false,
        }
    }
}
