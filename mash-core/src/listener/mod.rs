//! Stage runtime ("listener").
//!
//! One runtime per pipeline stage. It tracks the jobs announced to its stage,
//! persists them to the stage's job directory, runs a job's unit of work when
//! the upstream stage reports success, and publishes the outcome for the next
//! stage and the pipeline sequencer.

pub mod command;
pub mod credentials;
pub mod runtime;
pub mod scheduler;
pub mod worker;

pub use command::CommandWorkerFactory;
pub use credentials::{Credentials, CredentialsClient, CredentialsRequest, CredentialsResponse};
pub use runtime::{JobRecord, NewJobOutcome, SignalOutcome, StageRuntime, StageRuntimeConfig};
pub use scheduler::{JobScheduler, Removal};
pub use worker::{
    JobObserver, StageWorker, StageWorkerFactory, TracingObserver, WorkOutcome, WorkerContext,
};
