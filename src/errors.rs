use crate::state::JobState;

/// Errors raised while validating a job before it is inserted.
///
/// These never touch the database.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The job description is not a JSON object.
    #[error("job is not an object")]
    NotAnObject,
    /// The `type` property is missing.
    #[error("property 'type' not specified")]
    MissingType,
    /// The `type` property is not a string.
    #[error("property 'type' is not a string")]
    TypeNotString,
    /// The `type` property is an empty string.
    #[error("property 'type' is empty")]
    EmptyType,
    /// The `scheduledFor` property is not a valid timestamp.
    #[error("property 'scheduledFor' is not a date")]
    InvalidScheduledFor,
    /// The `maxAttempts` property is not a whole number.
    #[error("property 'maxAttempts' is not a number")]
    MaxAttemptsNotNumber,
    /// The `maxAttempts` property is negative or out of range.
    #[error("property 'maxAttempts' is negative or out of range")]
    InvalidMaxAttempts,
}

/// A state transition was attempted out of a terminal state.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("cannot transition job from {from} to {to}")]
pub struct TransitionError {
    /// The state the job was in.
    pub from: JobState,
    /// The state that was requested.
    pub to: JobState,
}

/// Errors returned by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// No waiting, eligible, and unlocked job was found.
    #[error("job queue is empty")]
    QueueEmpty,
    /// The job failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A job handle was asked to leave a terminal state.
    #[error(transparent)]
    Transition(#[from] TransitionError),
    /// A job handle was used after its claim ended.
    #[error("the job's claim was already released")]
    ClaimReleased,
    /// A completing operation failed to write to the store and the handler
    /// discarded the error.
    #[error("the job's outcome could not be recorded")]
    OutcomeNotRecorded,
    /// `start_processing` was called while the loop is already running.
    #[error("job processing is already running")]
    AlreadyProcessing,
    /// Error serializing the job payload.
    #[error("failed to serialize job data: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Error while provisioning the schema.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl QueueError {
    /// Whether this error only signals that nothing was available to claim.
    pub fn is_queue_empty(&self) -> bool {
        matches!(self, Self::QueueEmpty)
    }
}
