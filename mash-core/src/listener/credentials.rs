//! Credential exchange with the external credentials service.
//!
//! A stage asks for the accounts a job needs on exchange `credentials`, key
//! `request.<stage>`, and waits for the answer on `response.<stage>`. A
//! `null` answer means "not available yet": the request is repeated after the
//! retry interval until credentials arrive or the job is deleted.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::error::{MashError, Result};
use crate::messages::open_envelope;
use crate::stage::CREDENTIALS_EXCHANGE;

const REQUEST_KEY: &str = "credentials_request";
const RESPONSE_KEY: &str = "credentials_response";

/// Cloud account credentials, keyed by account name.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(Map<String, Value>);

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|account| (account, "<redacted>")))
            .finish()
    }
}

impl Credentials {
    pub fn new(accounts: Map<String, Value>) -> Self {
        Self(accounts)
    }

    pub fn get(&self, account: &str) -> Option<&Value> {
        self.0.get(account)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CredentialsRequest {
    pub id: String,
    pub cloud_accounts: Vec<String>,
    pub requesting_service: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CredentialsResponse {
    pub id: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

impl CredentialsResponse {
    pub fn parse(body: &str) -> Result<Self> {
        let (key, value) = open_envelope(body)?;
        if key != RESPONSE_KEY {
            return Err(MashError::InvalidMessage(format!(
                "expected `{RESPONSE_KEY}`, found `{key}`"
            )));
        }
        serde_json::from_value(value)
            .map_err(|err| MashError::InvalidMessage(format!("`{key}`: {err}")))
    }

    pub fn to_body(&self) -> Result<String> {
        let mut map = Map::new();
        map.insert(RESPONSE_KEY.to_string(), serde_json::to_value(self)?);
        Ok(Value::Object(map).to_string())
    }
}

type Waiters = HashMap<String, oneshot::Sender<Option<Credentials>>>;

/// Requests credentials for jobs of one stage and routes responses back to
/// the waiting job.
#[derive(Clone)]
pub struct CredentialsClient {
    broker: Arc<dyn Broker>,
    service: String,
    retry: Duration,
    waiters: Arc<Mutex<Waiters>>,
}

impl fmt::Debug for CredentialsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsClient")
            .field("service", &self.service)
            .field("retry", &self.retry)
            .finish()
    }
}

impl CredentialsClient {
    pub fn new(broker: Arc<dyn Broker>, service: impl Into<String>, retry: Duration) -> Self {
        Self {
            broker,
            service: service.into(),
            retry,
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn request_key(&self) -> String {
        format!("request.{}", self.service)
    }

    pub fn response_key(&self) -> String {
        format!("response.{}", self.service)
    }

    /// Declares the response queue. Returns its concrete name.
    pub async fn bind(&self) -> Result<String> {
        self.broker
            .bind_queue(
                CREDENTIALS_EXCHANGE,
                &self.response_key(),
                &format!("{}_response", self.service),
            )
            .await
    }

    /// Waits until credentials for `accounts` arrive. Only `cancel` ends the
    /// wait without credentials.
    pub async fn obtain(
        &self,
        job_id: &str,
        accounts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Credentials> {
        let request = CredentialsRequest {
            id: job_id.to_string(),
            cloud_accounts: accounts.to_vec(),
            requesting_service: self.service.clone(),
        };
        let mut envelope = Map::new();
        envelope.insert(REQUEST_KEY.to_string(), serde_json::to_value(&request)?);
        let body = Value::Object(envelope).to_string();

        loop {
            let (tx, rx) = oneshot::channel();
            self.waiters.lock().await.insert(job_id.to_string(), tx);

            if let Err(err) = self
                .broker
                .publish(CREDENTIALS_EXCHANGE, &self.request_key(), &body)
                .await
            {
                warn!(job_id, error = %err, "failed to request credentials");
            } else {
                debug!(job_id, accounts = ?accounts, "credentials requested");
            }

            let answer = tokio::select! {
                _ = cancel.cancelled() => {
                    self.waiters.lock().await.remove(job_id);
                    return Err(MashError::Cancelled(format!(
                        "credential wait for job {job_id}"
                    )));
                }
                answer = tokio::time::timeout(self.retry, rx) => answer,
            };

            match answer {
                Ok(Ok(Some(credentials))) => return Ok(credentials),
                Ok(Ok(None)) => {
                    info!(job_id, "credentials not yet available, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(MashError::Cancelled(format!(
                                "credential wait for job {job_id}"
                            )));
                        }
                        _ = tokio::time::sleep(self.retry) => {}
                    }
                }
                Ok(Err(_)) => debug!(job_id, "credential waiter replaced"),
                Err(_) => {
                    self.waiters.lock().await.remove(job_id);
                    debug!(job_id, "no credentials response yet, requesting again");
                }
            }
        }
    }

    /// Hands a response to the job waiting for it. Returns `false` when no
    /// job was waiting.
    pub async fn deliver(&self, response: CredentialsResponse) -> bool {
        let waiter = self.waiters.lock().await.remove(&response.id);
        match waiter {
            Some(tx) => tx.send(response.credentials).is_ok(),
            None => {
                warn!(job_id = %response.id, "credentials response for a job not waiting");
                false
            }
        }
    }
}
