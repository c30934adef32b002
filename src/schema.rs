//! Database schema definitions for SQLx.
//!
//! This module contains the persisted job row and the insertion form used by
//! [`JobQueue::add_job`](crate::JobQueue::add_job).

use crate::errors::ValidationError;
use crate::state::JobState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use sqlx::FromRow;

/// Default number of failures tolerated before a job is marked failed.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 1;

/// Represents a job record in the `job_queue` table
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct JobRecord {
    /// Unique identifier for the job, assigned by the database
    pub id: i64,
    /// Dot-separated type used to resolve the handler
    pub job_type: String,
    /// JSON payload handed to the handler
    pub data: Value,
    /// Current lifecycle state
    pub state: JobState,
    /// The job is not claimable before this instant
    pub scheduled_for: DateTime<Utc>,
    /// Number of failures tolerated before the job is marked failed
    pub max_attempts: i32,
    /// Number of recorded failures
    pub failed_attempts: i32,
    /// When a claim of this job last completed, successfully or not
    pub last_run: Option<DateTime<Utc>>,
    /// Message of the most recent failure
    pub last_failure_message: Option<String>,
    /// Timestamp when the job was inserted
    pub created_at: DateTime<Utc>,
}

/// A job that has not been inserted yet.
///
/// Unset fields get their defaults at insertion time: `data` is `{}`,
/// `scheduled_for` is the database's `NOW()` and `max_attempts` is
/// [`DEFAULT_MAX_ATTEMPTS`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    /// Handler type of the job
    pub job_type: String,
    /// JSON payload
    pub data: Value,
    /// Earliest time the job may run
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Number of failures tolerated
    pub max_attempts: Option<i32>,
}

impl NewJob {
    /// Create a job of the given type with an empty payload.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            data: Value::Object(Map::new()),
            scheduled_for: None,
            max_attempts: None,
        }
    }

    /// Set the payload.
    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Delay the job until `scheduled_for`.
    pub fn scheduled_for(mut self, scheduled_for: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(scheduled_for);
        self
    }

    /// Set how many failures are tolerated before the job is marked failed.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// The effective `max_attempts` after defaults.
    pub fn effective_max_attempts(&self) -> i32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    /// Check the job before it is sent to the database.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.job_type.is_empty() {
            return Err(ValidationError::EmptyType);
        }
        if self.effective_max_attempts() < 0 {
            return Err(ValidationError::InvalidMaxAttempts);
        }
        Ok(())
    }
}

/// Build a job from a loosely typed JSON description such as
/// `{"type": "sendEmail", "data": {...}, "scheduledFor": "...", "maxAttempts": 3}`.
impl TryFrom<Value> for NewJob {
    type Error = ValidationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(mut object) = value else {
            return Err(ValidationError::NotAnObject);
        };

        let job_type = match object.remove("type") {
            None | Some(Value::Null) => return Err(ValidationError::MissingType),
            Some(Value::String(job_type)) => job_type,
            Some(_) => return Err(ValidationError::TypeNotString),
        };

        let data = match object.remove("data") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(data) => data,
        };

        let scheduled_for = match object.remove("scheduledFor") {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map_err(|_| ValidationError::InvalidScheduledFor)?
                    .with_timezone(&Utc),
            ),
            Some(_) => return Err(ValidationError::InvalidScheduledFor),
        };

        let max_attempts = match object.remove("maxAttempts") {
            None | Some(Value::Null) => None,
            Some(Value::Number(number)) => Some(max_attempts_from_number(&number)?),
            Some(_) => return Err(ValidationError::MaxAttemptsNotNumber),
        };

        let job = Self {
            job_type,
            data,
            scheduled_for,
            max_attempts,
        };
        job.validate()?;
        Ok(job)
    }
}

/// Integers and whole-valued floats such as `3.0` are accepted.
fn max_attempts_from_number(number: &Number) -> Result<i32, ValidationError> {
    if let Some(n) = number.as_i64() {
        return i32::try_from(n).map_err(|_| ValidationError::InvalidMaxAttempts);
    }
    if number.is_u64() {
        return Err(ValidationError::InvalidMaxAttempts);
    }
    match number.as_f64() {
        Some(n) if n.fract() == 0.0 => {
            if (0.0..=f64::from(i32::MAX)).contains(&n) {
                Ok(n as i32)
            } else {
                Err(ValidationError::InvalidMaxAttempts)
            }
        }
        _ => Err(ValidationError::MaxAttemptsNotNumber),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn defaults_are_applied() {
        let job = NewJob::try_from(json!({ "type": "sendEmail" })).unwrap();
        assert_eq!(job.job_type, "sendEmail");
        assert_eq!(job.data, json!({}));
        assert_eq!(job.scheduled_for, None);
        assert_eq!(job.effective_max_attempts(), 1);
    }

    #[test]
    fn full_description_is_parsed() {
        let job = NewJob::try_from(json!({
            "type": "report.weekly",
            "data": { "to": "a@b.com" },
            "scheduledFor": "2030-01-02T03:04:05Z",
            "maxAttempts": 0,
        }))
        .unwrap();

        assert_eq!(job.job_type, "report.weekly");
        assert_eq!(job.data, json!({ "to": "a@b.com" }));
        assert_eq!(
            job.scheduled_for,
            Some(Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap())
        );
        assert_eq!(job.max_attempts, Some(0));
    }

    #[test]
    fn rejects_non_objects() {
        assert_eq!(
            NewJob::try_from(json!(1)),
            Err(ValidationError::NotAnObject)
        );
        assert_eq!(
            NewJob::try_from(json!(["sendEmail"])),
            Err(ValidationError::NotAnObject)
        );
    }

    #[test]
    fn rejects_bad_type() {
        assert_eq!(
            NewJob::try_from(json!({ "data": {} })),
            Err(ValidationError::MissingType)
        );
        assert_eq!(
            NewJob::try_from(json!({ "type": 123 })),
            Err(ValidationError::TypeNotString)
        );
        assert_eq!(
            NewJob::try_from(json!({ "type": "" })),
            Err(ValidationError::EmptyType)
        );
    }

    #[test]
    fn rejects_bad_scheduled_for() {
        assert_eq!(
            NewJob::try_from(json!({ "type": "a", "scheduledFor": 123 })),
            Err(ValidationError::InvalidScheduledFor)
        );
        assert_eq!(
            NewJob::try_from(json!({ "type": "a", "scheduledFor": "tomorrow" })),
            Err(ValidationError::InvalidScheduledFor)
        );
    }

    #[test]
    fn rejects_bad_max_attempts() {
        assert_eq!(
            NewJob::try_from(json!({ "type": "a", "maxAttempts": -123 })),
            Err(ValidationError::InvalidMaxAttempts)
        );
        assert_eq!(
            NewJob::try_from(json!({ "type": "a", "maxAttempts": "3" })),
            Err(ValidationError::MaxAttemptsNotNumber)
        );
        assert_eq!(
            NewJob::try_from(json!({ "type": "a", "maxAttempts": 1.5 })),
            Err(ValidationError::MaxAttemptsNotNumber)
        );
        assert_eq!(
            NewJob::try_from(json!({ "type": "a", "maxAttempts": u64::MAX })),
            Err(ValidationError::InvalidMaxAttempts)
        );
        assert_eq!(
            NewJob::try_from(json!({ "type": "a", "maxAttempts": -2.0 })),
            Err(ValidationError::InvalidMaxAttempts)
        );
        assert_eq!(
            NewJob::try_from(json!({ "type": "a", "maxAttempts": 1e12 })),
            Err(ValidationError::InvalidMaxAttempts)
        );
    }

    #[test]
    fn whole_float_max_attempts_are_accepted() {
        let job = NewJob::try_from(json!({ "type": "a", "maxAttempts": 3.0 })).unwrap();
        assert_eq!(job.max_attempts, Some(3));

        let job = NewJob::try_from(json!({ "type": "a", "maxAttempts": 0.0 })).unwrap();
        assert_eq!(job.max_attempts, Some(0));
    }

    #[test]
    fn builder_validation() {
        assert!(NewJob::new("a").max_attempts(3).validate().is_ok());
        assert_eq!(
            NewJob::new("a").max_attempts(-1).validate(),
            Err(ValidationError::InvalidMaxAttempts)
        );
        assert_eq!(NewJob::new("").validate(), Err(ValidationError::EmptyType));
    }
}
