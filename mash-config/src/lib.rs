//! Configuration for mash processes.
//!
//! Values come from three layers, later ones winning: built-in defaults, a
//! TOML file (`--config`, `MASH_CONFIG`, `mash.toml` or `config/mash.toml`)
//! and `MASH_*` environment variables, optionally seeded from a `.env` file.
//!
//! ```toml
//! [broker]
//! url = "redis://broker.internal:6379"
//!
//! [pipeline]
//! services = ["obs", "upload", "test", "publish"]
//! job_directory = "/var/lib/mash/jobs"
//!
//! [listener]
//! max_workers = 4
//! credentials_retry_secs = 30
//!
//! [notification]
//! source = "job_creator"
//!
//! [persistence]
//! status_url = "http://mash-api.internal/jobs"
//! ```

pub mod loader;
pub mod models;
pub mod sources;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    BrokerConfig, Config, ConfigMetadata, ListenerConfig, NotificationConfig,
    NotificationSource, PersistenceConfig, PipelineConfig,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
