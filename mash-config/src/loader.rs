use once_cell::sync::Lazy;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use url::Url;

use super::{
    models::{
        BrokerConfig, Config, ConfigMetadata, ListenerConfig,
        NotificationConfig, PersistenceConfig, PipelineConfig,
    },
    sources::{EnvConfig, FileConfig},
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![PathBuf::from("mash.toml"), PathBuf::from("config/mash.toml")]
});

pub const DEFAULT_BROKER_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_JOB_DIRECTORY: &str = "/var/lib/mash/jobs";
pub const DEFAULT_SERVICES: [&str; 7] = [
    "obs",
    "upload",
    "create",
    "test",
    "replicate",
    "publish",
    "deprecate",
];

const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_WORKERS: usize = 8;
const DEFAULT_CREDENTIALS_RETRY: Duration = Duration::from_secs(60);
const DEFAULT_RECURRING_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Loads `.env`, the TOML file and `MASH_*` overrides, in increasing
    /// order of precedence.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let env_config = EnvConfig::gather();
        let (file_config, config_path) = self.load_file_config(&env_config)?;

        compose(
            file_config,
            env_config,
            ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        )
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let mut source = ConfigPathSource::default();

        if let Some(explicit) = &self.options.config_path {
            source.explicit = Some(explicit.clone());
        } else if let Some(from_env) = &env_config.config_path {
            source.env = Some(from_env.clone());
        } else {
            source.default = DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
                .cloned();
        }

        let Some((path, provenance)) = source.resolved_path() else {
            return Ok((None, None));
        };

        if !path.exists() {
            if provenance.is_explicit() {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let file_config = read_file_config(&path)?;
        Ok((Some(file_config), Some(path)))
    }
}

/// Parses one TOML configuration file.
pub fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents =
        fs::read_to_string(path).map_err(|err| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source: err,
        })?;
    toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source: err,
    })
}

/// Merges file and environment values over the defaults and applies the
/// guard rails. Environment values win over the file.
pub fn compose(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> Result<ConfigLoad, ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    if metadata.config_path.is_none() {
        warnings.push_with_hint(
            "No mash.toml detected; falling back to environment variables",
            "Pass --config or set MASH_CONFIG to point at a configuration file",
        );
    }

    let FileConfig {
        broker: file_broker,
        pipeline: file_pipeline,
        listener: file_listener,
        notification: file_notification,
        persistence: file_persistence,
    } = file_config.unwrap_or_default();

    let broker = BrokerConfig {
        url: env
            .broker_url
            .or(file_broker.url)
            .unwrap_or_else(|| DEFAULT_BROKER_URL.to_string()),
        consumer_name: env.consumer_name.or(file_broker.consumer_name),
        block_timeout: env
            .block_timeout
            .or(file_broker.block_timeout_secs.map(Duration::from_secs))
            .unwrap_or(DEFAULT_BLOCK_TIMEOUT),
    };

    let pipeline = PipelineConfig {
        services: env.services.or(file_pipeline.services).unwrap_or_else(|| {
            DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect()
        }),
        job_directory: env
            .job_directory
            .or(file_pipeline.job_directory)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_JOB_DIRECTORY)),
    };

    let listener = ListenerConfig {
        max_workers: env
            .max_workers
            .or(file_listener.max_workers)
            .unwrap_or(DEFAULT_MAX_WORKERS),
        credentials_retry: env
            .credentials_retry
            .or(file_listener.credentials_retry_secs.map(Duration::from_secs))
            .unwrap_or(DEFAULT_CREDENTIALS_RETRY),
        recurring_interval: env
            .recurring_interval
            .or(file_listener.recurring_interval_secs.map(Duration::from_secs))
            .unwrap_or(DEFAULT_RECURRING_INTERVAL),
    };

    let notification = NotificationConfig {
        enabled: env
            .notification_enabled
            .or(file_notification.enabled)
            .unwrap_or(true),
        source: env
            .notification_source
            .or(file_notification.source)
            .unwrap_or_default(),
    };

    let status_url = env
        .status_url
        .or(file_persistence.status_url)
        .filter(|value| !value.trim().is_empty())
        .map(|raw| {
            Url::parse(raw.trim())
                .map_err(|source| ConfigLoadError::InvalidStatusUrl { source })
        })
        .transpose()?;
    let persistence = PersistenceConfig { status_url };

    let config = Config {
        broker,
        pipeline,
        listener,
        notification,
        persistence,
        metadata,
    };

    let guard_warnings = validation::apply_guard_rails(&config)?;
    warnings.extend(guard_warnings);

    Ok(ConfigLoad { config, warnings })
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid status service URL")]
    InvalidStatusUrl {
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug, Default)]
struct ConfigPathSource {
    explicit: Option<PathBuf>,
    env: Option<PathBuf>,
    default: Option<PathBuf>,
}

impl ConfigPathSource {
    fn resolved_path(&self) -> Option<(PathBuf, ConfigPathProvenance)> {
        if let Some(path) = &self.explicit {
            return Some((path.clone(), ConfigPathProvenance::Explicit));
        }
        if let Some(path) = &self.env {
            return Some((path.clone(), ConfigPathProvenance::Env));
        }
        if let Some(path) = &self.default {
            return Some((path.clone(), ConfigPathProvenance::Default));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigPathProvenance {
    Explicit,
    Env,
    Default,
}

impl ConfigPathProvenance {
    fn is_explicit(self) -> bool {
        matches!(
            self,
            ConfigPathProvenance::Explicit | ConfigPathProvenance::Env
        )
    }
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}
