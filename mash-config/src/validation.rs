use std::time::Duration;

use thiserror::Error;

use super::models::Config;

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("invalid pipeline service order: {reason}")]
    InvalidServiceOrder { reason: String },
    #[error("listener max_workers must be at least 1")]
    ZeroWorkers,
    #[error("broker url `{url}` is not a redis:// or rediss:// url")]
    UnsupportedBrokerUrl { url: String },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

const MIN_CREDENTIALS_RETRY: Duration = Duration::from_secs(1);

pub fn apply_guard_rails(
    config: &Config,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    config
        .service_order()
        .map_err(|err| ConfigGuardRailError::InvalidServiceOrder {
            reason: err.to_string(),
        })?;

    if config.listener.max_workers == 0 {
        return Err(ConfigGuardRailError::ZeroWorkers);
    }

    let scheme = config
        .broker
        .url
        .split_once("://")
        .map(|(scheme, _)| scheme)
        .unwrap_or_default();
    if !matches!(scheme, "redis" | "rediss" | "redis+unix" | "unix") {
        return Err(ConfigGuardRailError::UnsupportedBrokerUrl {
            url: config.broker.url.clone(),
        });
    }

    if config.listener.credentials_retry < MIN_CREDENTIALS_RETRY {
        warnings.push_with_hint(
            "credentials retry interval below one second",
            "Raise MASH_CREDENTIALS_RETRY to avoid flooding the credentials service",
        );
    }

    if config.persistence.status_url.is_none() {
        warnings.push_with_hint(
            "No status service configured; job status updates are only logged",
            "Set MASH_STATUS_URL or persistence.status_url",
        );
    }

    if !config.notification.enabled {
        warnings.push("Job notifications are disabled");
    }

    Ok(warnings)
}
