#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
mod config;
mod errors;
mod events;
mod job;
mod queue;
mod registry;
/// Database schema definitions.
pub mod schema;
mod state;
mod storage;
mod util;
mod worker;

/// The trait for defining typed jobs.
pub use self::background_job::BackgroundJob;
/// Queue configuration.
pub use self::config::{DEFAULT_POLL_INTERVAL, DEFAULT_RETRY_BACKOFF, QueueConfig};
/// Error types.
pub use self::errors::{QueueError, TransitionError, ValidationError};
/// Job lifecycle events.
pub use self::events::QueueEvent;
/// Handle to a claimed job.
pub use self::job::Job;
/// The queue engine.
pub use self::queue::{DEFAULT_MAX_CONNECTIONS, JobQueue, JobQueueBuilder};
/// Handler registry.
pub use self::registry::{
    Entry, ErrorHook, EventHook, HandlerFn, HandlerRegistry, ReservedKey, ShutdownHook,
};
/// Persisted job row and insertion form.
pub use self::schema::{JobRecord, NewJob};
/// The job state machine.
pub use self::state::JobState;
/// Schema provisioning.
pub use self::storage::setup_database;
/// The processing loop.
pub use self::worker::{LoopState, RunHandle};
