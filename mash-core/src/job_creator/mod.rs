//! Pipeline sequencer ("job creator").
//!
//! Receives job submissions, publishes the per-stage documents, and turns the
//! stream of stage results into status updates and notifications.

pub mod builder;
pub mod sequencer;
pub mod status;

pub use builder::{MessageBuilder, MessageBuilders, PassthroughBuilder};
pub use sequencer::{JobCreator, SubmitOutcome};
#[cfg(feature = "http")]
pub use status::HttpStatusSink;
pub use status::{LogStatusSink, PRIVATE_FIELDS, StatusSink, StatusUpdate};
