use crate::errors::QueueError;
use crate::job::Job;
use crate::queue::JobQueue;
use crate::schema::{DEFAULT_MAX_ATTEMPTS, NewJob};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use tracing::instrument;

/// Trait for defining typed jobs on top of the untyped queue.
///
/// The job's fields are stored as the JSON payload and decoded again before
/// [`run`](Self::run) is called. Register it with
/// [`HandlerRegistry::register`](crate::HandlerRegistry::register).
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Job type, used to resolve the handler.
    ///
    /// May contain dots to place the handler inside a namespace. This MUST be
    /// unique for the whole application.
    const JOB_TYPE: &'static str;

    /// Number of failures tolerated before the job is marked failed.
    const MAX_ATTEMPTS: i32 = DEFAULT_MAX_ATTEMPTS;

    /// Execute the job.
    ///
    /// Returning `Ok` finishes the job unless `job` was already finished,
    /// failed, rescheduled or destroyed. Returning `Err` fails it.
    fn run(&self, job: &Job) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Build the insertion form of this job.
    fn to_new_job(&self) -> Result<NewJob, QueueError> {
        let data = serde_json::to_value(self)?;
        Ok(NewJob::new(Self::JOB_TYPE)
            .data(data)
            .max_attempts(Self::MAX_ATTEMPTS))
    }

    /// Enqueue this job to run as soon as possible.
    ///
    /// Returns the id of the inserted job.
    #[instrument(name = "pgqueue.enqueue", skip(self, queue), fields(message = Self::JOB_TYPE))]
    fn enqueue<'a>(&'a self, queue: &'a JobQueue) -> BoxFuture<'a, Result<i64, QueueError>> {
        match self.to_new_job() {
            Ok(job) => queue.add_job(job).boxed(),
            Err(err) => async move { Err(err) }.boxed(),
        }
    }

    /// Enqueue this job to run no earlier than `scheduled_for`.
    fn enqueue_at<'a>(
        &'a self,
        queue: &'a JobQueue,
        scheduled_for: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<i64, QueueError>> {
        match self.to_new_job() {
            Ok(job) => queue.add_job(job.scheduled_for(scheduled_for)).boxed(),
            Err(err) => async move { Err(err) }.boxed(),
        }
    }
}
