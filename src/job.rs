use crate::errors::QueueError;
use crate::events::QueueEvent;
use crate::registry::HandlerRegistry;
use crate::schema::JobRecord;
use crate::state::JobState;
use crate::storage::ClaimSession;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Handle to a claimed job, passed to its handler.
///
/// The handle completes the claim through [`finish`](Self::finish),
/// [`fail`](Self::fail), [`reschedule`](Self::reschedule) or
/// [`destroy`](Self::destroy). If the handler returns `Ok` without calling any
/// of them, the job is finished on its behalf. Cloning is cheap and clones
/// share state.
///
/// Outcomes are written through the claim's transaction and become visible
/// once the claim is released, after the handler returns. Using the handle
/// after that fails with [`QueueError::ClaimReleased`].
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

struct JobInner {
    record: JobRecord,
    state: Mutex<JobState>,
    handled: AtomicBool,
    aborted: AtomicBool,
    session: ClaimSession,
    retry_backoff: Duration,
    registry: Arc<HandlerRegistry>,
}

impl Job {
    pub(crate) fn new(
        record: JobRecord,
        session: ClaimSession,
        retry_backoff: Duration,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let state = record.state;
        Self {
            inner: Arc::new(JobInner {
                record,
                state: Mutex::new(state),
                handled: AtomicBool::new(false),
                aborted: AtomicBool::new(false),
                session,
                retry_backoff,
                registry,
            }),
        }
    }

    /// Database id of the job.
    pub fn id(&self) -> i64 {
        self.inner.record.id
    }

    /// Type of the job.
    pub fn job_type(&self) -> &str {
        &self.inner.record.job_type
    }

    /// Raw JSON payload.
    pub fn data(&self) -> &Value {
        &self.inner.record.data
    }

    /// Decode the payload.
    pub fn payload<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        T::deserialize(self.data())
            .with_context(|| format!("Failed to decode payload of job type {}", self.job_type()))
    }

    /// The row as it was when the job was claimed.
    pub fn record(&self) -> &JobRecord {
        &self.inner.record
    }

    /// Current state, as far as this handle knows.
    pub fn state(&self) -> JobState {
        *self.lock_state()
    }

    /// Whether a completing operation has been recorded through this handle.
    pub fn is_handled(&self) -> bool {
        self.inner.handled.load(Ordering::SeqCst)
    }

    /// Whether a completing operation failed to write to the store.
    ///
    /// The claim's transaction is rolled back in that case.
    pub(crate) fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Mark the job as finished.
    pub async fn finish(&self) -> Result<(), QueueError> {
        self.check_transition(JobState::Finished)?;
        debug!("Finishing job…");
        if !self.persist(self.inner.session.finish_job(self.id())).await? {
            warn!("Job was no longer waiting when finishing it");
        }
        self.complete(JobState::Finished);
        self.emit(QueueEvent::Finished);
        Ok(())
    }

    /// Delete the job.
    pub async fn destroy(&self) -> Result<(), QueueError> {
        self.check_transition(JobState::Destroyed)?;
        debug!("Destroying job…");
        self.persist(self.inner.session.delete_job(self.id())).await?;
        self.complete(JobState::Destroyed);
        self.emit(QueueEvent::Destroyed);
        Ok(())
    }

    /// Put the job back so it runs again at `scheduled_for`.
    ///
    /// This completes the current claim, so `finished` is emitted after
    /// `rescheduled`.
    pub async fn reschedule(&self, scheduled_for: DateTime<Utc>) -> Result<(), QueueError> {
        self.check_transition(JobState::Waiting)?;
        debug!(%scheduled_for, "Rescheduling job…");
        let session = &self.inner.session;
        if !self.persist(session.reschedule_job(self.id(), scheduled_for)).await? {
            warn!("Job was no longer waiting when rescheduling it");
        }
        self.complete(JobState::Waiting);
        self.emit(QueueEvent::Rescheduled);
        self.emit(QueueEvent::Finished);
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// The job is marked failed once its attempts are used up, otherwise it
    /// is retried after the queue's retry backoff.
    pub async fn fail(&self, error: impl Into<anyhow::Error>) -> Result<(), QueueError> {
        self.record_failure(error.into(), None).await
    }

    /// Record a failed attempt, retrying at `retry_at` if attempts are left.
    pub async fn fail_with_retry_at(
        &self,
        error: impl Into<anyhow::Error>,
        retry_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.record_failure(error.into(), Some(retry_at)).await
    }

    async fn record_failure(
        &self,
        error: anyhow::Error,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError> {
        self.check_transition(JobState::Failed)?;

        let message = error.to_string();
        let write = self.inner.session.record_failure(
            self.id(),
            &message,
            retry_at,
            self.inner.retry_backoff,
        );
        let updated = self.persist(write).await?;

        match updated {
            Some(job) if job.state == JobState::Failed => {
                warn!(
                    attempts = job.failed_attempts,
                    "Job failed permanently: {message}"
                );
                self.complete(JobState::Failed);
            }
            Some(job) => {
                info!(
                    attempts = job.failed_attempts,
                    max_attempts = job.max_attempts,
                    retry_at = %job.scheduled_for,
                    "Job failed, will retry: {message}"
                );
                self.complete(JobState::Waiting);
            }
            None => {
                warn!("Job was no longer waiting when recording failure: {message}");
                self.complete(JobState::Failed);
            }
        }

        self.emit(QueueEvent::Failed);
        self.report_error(&error);
        Ok(())
    }

    pub(crate) fn emit(&self, event: QueueEvent) {
        debug!(%event, "Job event");
        if let Some(hook) = self.inner.registry.event_hook() {
            hook(event, self);
        }
    }

    pub(crate) fn report_error(&self, error: &anyhow::Error) {
        if let Some(hook) = self.inner.registry.error_hook() {
            hook(error, self);
        }
    }

    fn check_transition(&self, next: JobState) -> Result<(), QueueError> {
        self.lock_state().transition(next)?;
        Ok(())
    }

    /// Runs a store write, remembering whether it failed.
    async fn persist<T>(
        &self,
        write: impl Future<Output = Result<T, QueueError>>,
    ) -> Result<T, QueueError> {
        let result = write.await;
        if result.is_err() {
            self.inner.aborted.store(true, Ordering::SeqCst);
        }
        result
    }

    fn complete(&self, state: JobState) {
        *self.lock_state() = state;
        self.inner.handled.store(true, Ordering::SeqCst);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, JobState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id())
            .field("job_type", &self.job_type())
            .field("state", &self.state())
            .field("handled", &self.is_handled())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}
