//! # Mash Core
//!
//! Orchestration engine for multi-stage cloud image pipelines.
//!
//! A pipeline is a fixed order of stages (for example `build`, `upload`,
//! `test`, `publish`). Every stage runs as its own process around a
//! [`listener::StageRuntime`], and one [`job_creator::JobCreator`] accepts job
//! submissions, fans them out to the stages and follows their results. All
//! components talk through a [`broker::Broker`] with explicitly acknowledged,
//! at-least-once delivery.
//!
//! ## Architecture
//!
//! - [`broker`]: broker client trait plus the Redis Streams and in-process
//!   implementations
//! - [`messages`]: wire envelopes, parsed once into typed messages
//! - [`job`]: job documents, stage jobs, results and statuses
//! - [`stage`]: the stage order and fixed exchange/routing-key names
//! - [`store`]: per-stage job files used for crash recovery
//! - [`listener`]: the stage runtime, its scheduler and unit-of-work seam
//! - [`job_creator`]: the pipeline sequencer and status forwarding
//! - [`notify`]: the notification gate and notifiers
//!
//! ## Feature Flags
//!
//! - `redis` (default): [`broker::RedisBroker`]
//! - `http` (default): `job_creator::HttpStatusSink`

pub mod broker;
pub mod error;
pub mod job;
pub mod job_creator;
pub mod listener;
pub mod messages;
pub mod notify;
pub mod stage;
pub mod store;

pub use error::{MashError, Result};
pub use job::{CloudTarget, JobDocument, JobResult, JobStatus, ResultStatus, StageJob, UtcTime};
pub use stage::ServiceOrder;
