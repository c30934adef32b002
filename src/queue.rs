use crate::config::QueueConfig;
use crate::errors::QueueError;
use crate::events::QueueEvent;
use crate::job::Job;
use crate::registry::HandlerRegistry;
use crate::schema::{JobRecord, NewJob};
use crate::storage::{self, ClaimSession};
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use crate::worker::LoopState;
use anyhow::anyhow;
use futures_util::FutureExt;
use sentry_core::{Hub, SentryFutureExt};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::convert::Infallible;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tracing::{Instrument, debug, error, info_span, instrument, trace, warn};

/// Pool size used by [`JobQueue::connect`].
///
/// A claim pins one connection while its handler runs and writes the job's
/// outcome through it.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// A durable job queue backed by a PostgreSQL table.
///
/// Any number of `JobQueue`s, in any number of processes, may share one
/// database. A job is only ever processed by one of them at a time. Cloning is
/// cheap and clones share handlers, configuration and the processing loop.
#[derive(Clone)]
pub struct JobQueue {
    pub(crate) shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) pool: PgPool,
    pub(crate) config: QueueConfig,
    pub(crate) registry: RwLock<Arc<HandlerRegistry>>,
    pub(crate) loop_state: watch::Sender<LoopState>,
    pub(crate) stop_requested: AtomicBool,
    pub(crate) stop_signal: Notify,
}

impl JobQueue {
    /// Create a queue with the default configuration and no handlers.
    pub fn new(pool: PgPool) -> Self {
        Self::builder(pool).build()
    }

    /// Start configuring a queue.
    pub fn builder(pool: PgPool) -> JobQueueBuilder {
        JobQueueBuilder {
            pool,
            config: QueueConfig::default(),
            registry: HandlerRegistry::default(),
        }
    }

    /// Connect to `database_url` with a pool of [`DEFAULT_MAX_CONNECTIONS`].
    pub async fn connect(database_url: &str) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Close every connection of the pool.
    pub async fn disconnect(&self) {
        self.shared.pool.close().await;
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.shared.pool
    }

    /// The queue's configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Snapshot of the current handlers.
    pub fn handlers(&self) -> Arc<HandlerRegistry> {
        self.shared
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace all handlers and hooks.
    pub fn set_handlers(&self, registry: HandlerRegistry) {
        *self
            .shared
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(registry);
    }

    /// Merge handlers and hooks into the current set. Incoming entries win.
    pub fn add_handlers(&self, registry: HandlerRegistry) {
        let mut current = self
            .shared
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut merged = HandlerRegistry::clone(&current);
        merged.merge(registry);
        *current = Arc::new(merged);
    }

    /// Remove all handlers and hooks.
    pub fn clear_handlers(&self) {
        self.set_handlers(HandlerRegistry::default());
    }

    /// Validate and insert a job. Returns its id.
    #[instrument(name = "pgqueue.add_job", skip(self, job), fields(job.type = %job.job_type))]
    pub async fn add_job(&self, job: NewJob) -> Result<i64, QueueError> {
        job.validate()?;
        let id = storage::insert_job(&self.shared.pool, &job).await?;
        debug!(job.id = id, "Job added");
        Ok(id)
    }

    /// Validate a loosely typed JSON job description and insert it.
    ///
    /// See [`NewJob`]'s `TryFrom<Value>` implementation for the accepted shape.
    pub async fn add_job_json(&self, job: Value) -> Result<i64, QueueError> {
        let job = NewJob::try_from(job)?;
        self.add_job(job).await
    }

    /// Claim and run the oldest eligible job.
    ///
    /// Returns the id of the processed job, whether its handler succeeded or
    /// not. Handler errors are recorded on the job and never returned here.
    ///
    /// Returns:
    /// - `Ok(job_id)` if a job was claimed and run
    /// - `Err(QueueError::QueueEmpty)` if no job could be claimed
    /// - any other `Err` for database failures, including failures to record
    ///   the job's outcome
    pub async fn process_next_job(&self) -> Result<i64, QueueError> {
        let registry = self.handlers();
        let job_types = registry.available_types();

        trace!("Looking for next job…");

        // Holds the claim lock and the job's outcome until released
        let session = ClaimSession::begin(&self.shared.pool).await?;

        let Some(record) = session.claim_next(&job_types).await? else {
            session.release().await?;
            return Err(QueueError::QueueEmpty);
        };

        let job_id = record.id;
        let span = info_span!("job", job.id = %record.id, job.type = %record.job_type);
        let retry_backoff = self.shared.config.retry_backoff;
        let job = Job::new(record, session.clone(), retry_backoff, registry.clone());

        let outcome = self
            .run_claimed(&registry, &job)
            .instrument(span.clone())
            .await;

        let _enter = span.enter();
        match outcome {
            Ok(()) => {
                session.release().await?;
                trace!("Claim released");
                Ok(job_id)
            }
            Err(error) => {
                error!("Failed to record job outcome: {error}");
                if let Err(abort_error) = session.abort().await {
                    warn!("Failed to roll back claim: {abort_error}");
                }
                Err(error)
            }
        }
    }

    async fn run_claimed(&self, registry: &HandlerRegistry, job: &Job) -> Result<(), QueueError> {
        let handler = registry.resolve(job.job_type());

        debug!("Running job…");
        job.emit(QueueEvent::Starting);

        let result = with_sentry_transaction(job.job_type(), || async {
            let Some(handler) = handler else {
                return Err(anyhow!("Unknown job type {}", job.job_type()));
            };

            AssertUnwindSafe(handler(job.clone()))
                .catch_unwind()
                .await
                .map_err(|e| try_to_extract_panic_info(&*e))
                .and_then(std::convert::identity)
        })
        .bind_hub(Hub::current())
        .await;

        if job.is_aborted() {
            return Err(match result {
                Err(error) => error
                    .downcast::<QueueError>()
                    .unwrap_or(QueueError::OutcomeNotRecorded),
                Ok(()) => QueueError::OutcomeNotRecorded,
            });
        }

        match result {
            Ok(()) if job.is_handled() => Ok(()),
            Ok(()) => job.finish().await,
            Err(error) if job.is_handled() => {
                warn!("Job failed after it was completed: {error}");
                job.report_error(&error);
                Ok(())
            }
            Err(error) => {
                warn!("Failed to run job: {error}");
                job.fail(error).await
            }
        }
    }

    /// Process jobs until none can be claimed.
    ///
    /// Only returns once draining stops, with `QueueError::QueueEmpty` when
    /// the queue ran dry or the error that interrupted it.
    pub async fn process_all_jobs(&self) -> Result<Infallible, QueueError> {
        loop {
            self.process_next_job().await?;
        }
    }

    /// A single job by id.
    pub async fn get_job(&self, job_id: i64) -> Result<Option<JobRecord>, QueueError> {
        Ok(storage::find_job(&self.shared.pool, job_id).await?)
    }

    /// Jobs that exhausted their attempts.
    pub async fn get_failed_jobs(&self) -> Result<Vec<JobRecord>, QueueError> {
        Ok(storage::failed_jobs(&self.shared.pool).await?)
    }

    /// Every stored job. Destroyed jobs are gone and not included.
    pub async fn get_all_jobs(&self) -> Result<Vec<JobRecord>, QueueError> {
        Ok(storage::all_jobs(&self.shared.pool).await?)
    }

    /// Number of waiting jobs, including those scheduled in the future.
    pub async fn waiting_count(&self) -> Result<i64, QueueError> {
        Ok(storage::waiting_job_count(&self.shared.pool).await?)
    }

    /// Number of jobs that exhausted their attempts.
    pub async fn failed_count(&self) -> Result<i64, QueueError> {
        Ok(storage::failed_job_count(&self.shared.pool).await?)
    }

    /// Delete every job. Returns how many were deleted.
    pub async fn clear_all_jobs(&self) -> Result<u64, QueueError> {
        let deleted = storage::delete_all_jobs(&self.shared.pool).await?;
        debug!(deleted, "Cleared all jobs");
        Ok(deleted)
    }

    /// Check that the database is reachable.
    pub async fn check_database(&self) -> Result<(), QueueError> {
        Ok(storage::ping(&self.shared.pool).await?)
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.shared.config)
            .field("handlers", &self.handlers())
            .field("loop_state", &*self.shared.loop_state.borrow())
            .finish()
    }
}

/// Builder for a [`JobQueue`].
#[derive(Debug)]
pub struct JobQueueBuilder {
    pool: PgPool,
    config: QueueConfig,
    registry: HandlerRegistry,
}

impl JobQueueBuilder {
    /// Set the default delay between drain cycles of the processing loop.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple queues
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Set how far a failed job with attempts left is pushed back.
    pub fn retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.config.retry_backoff = retry_backoff;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the initial handlers.
    pub fn handlers(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Build the queue.
    pub fn build(self) -> JobQueue {
        let (loop_state, _) = watch::channel(LoopState::Idle);
        JobQueue {
            shared: Arc::new(Shared {
                pool: self.pool,
                config: self.config,
                registry: RwLock::new(Arc::new(self.registry)),
                loop_state,
                stop_requested: AtomicBool::new(false),
                stop_signal: Notify::new(),
            }),
        }
    }
}
