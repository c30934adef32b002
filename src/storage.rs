use crate::errors::QueueError;
use crate::schema::{JobRecord, NewJob};
use chrono::{DateTime, Utc};
use sqlx::{Connection, PgConnection, PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Create the `job_queue` table and its types if they do not exist yet.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// A database session holding a claim lock.
///
/// Locks are transaction-scoped advisory locks, so they belong to the single
/// pooled connection pinned by the transaction. The job's outcome is written
/// through the same transaction and becomes visible when the lock is released
/// by [`release`](Self::release). [`abort`](Self::abort) rolls the outcome back
/// instead. If the session is dropped without either, sqlx rolls back.
///
/// Clones share the transaction, so the job handle can write through it.
#[derive(Clone)]
pub(crate) struct ClaimSession {
    tx: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
}

impl ClaimSession {
    pub(crate) async fn begin(pool: &PgPool) -> Result<Self, sqlx::Error> {
        let tx = pool.begin().await?;
        Ok(Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        })
    }

    /// Finds the oldest eligible job that no other session holds, and locks it.
    ///
    /// Candidates whose lock is held elsewhere, or which stopped being eligible
    /// before we got the lock, are skipped.
    pub(crate) async fn claim_next(
        &self,
        job_types: &[String],
    ) -> Result<Option<JobRecord>, QueueError> {
        let mut guard = self.transaction().await;
        let Some(tx) = guard.as_mut() else {
            return Err(QueueError::ClaimReleased);
        };
        let mut skipped = Vec::new();
        while let Some(id) = next_eligible_job_id(tx, job_types, &skipped).await? {
            if try_acquire(tx, id).await? {
                if let Some(job) = find_eligible_job(tx, id, job_types).await? {
                    return Ok(Some(job));
                }
            }
            skipped.push(id);
        }
        Ok(None)
    }

    pub(crate) async fn finish_job(&self, job_id: i64) -> Result<bool, QueueError> {
        let mut guard = self.transaction().await;
        let Some(tx) = guard.as_mut() else {
            return Err(QueueError::ClaimReleased);
        };
        Ok(finish_job(tx, job_id).await?)
    }

    pub(crate) async fn reschedule_job(
        &self,
        job_id: i64,
        scheduled_for: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let mut guard = self.transaction().await;
        let Some(tx) = guard.as_mut() else {
            return Err(QueueError::ClaimReleased);
        };
        Ok(reschedule_job(tx, job_id, scheduled_for).await?)
    }

    pub(crate) async fn delete_job(&self, job_id: i64) -> Result<bool, QueueError> {
        let mut guard = self.transaction().await;
        let Some(tx) = guard.as_mut() else {
            return Err(QueueError::ClaimReleased);
        };
        Ok(delete_job(tx, job_id).await?)
    }

    pub(crate) async fn record_failure(
        &self,
        job_id: i64,
        message: &str,
        retry_at: Option<DateTime<Utc>>,
        backoff: Duration,
    ) -> Result<Option<JobRecord>, QueueError> {
        let mut guard = self.transaction().await;
        let Some(tx) = guard.as_mut() else {
            return Err(QueueError::ClaimReleased);
        };
        Ok(record_failure(tx, job_id, message, retry_at, backoff).await?)
    }

    /// Commit the job's outcome and release the lock.
    pub(crate) async fn release(&self) -> Result<(), QueueError> {
        match self.tx.lock().await.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Ok(()),
        }
    }

    /// Discard the job's outcome and release the lock.
    pub(crate) async fn abort(&self) -> Result<(), QueueError> {
        match self.tx.lock().await.take() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Ok(()),
        }
    }

    async fn transaction(&self) -> MutexGuard<'_, Option<Transaction<'static, Postgres>>> {
        self.tx.lock().await
    }
}

/// Try to take the lock for `job_id` without blocking.
async fn try_acquire(conn: &mut PgConnection, job_id: i64) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_xact_lock($1)")
        .bind(job_id)
        .fetch_one(conn)
        .await
}

async fn next_eligible_job_id(
    conn: &mut PgConnection,
    job_types: &[String],
    skipped: &[i64],
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r"
        SELECT id
        FROM job_queue
        WHERE state = 'waiting'
          AND scheduled_for <= NOW()
          AND job_type = ANY($1)
          AND NOT (id = ANY($2))
        ORDER BY scheduled_for ASC, id ASC
        LIMIT 1
        ",
    )
    .bind(job_types)
    .bind(skipped)
    .fetch_optional(conn)
    .await
}

async fn find_eligible_job(
    conn: &mut PgConnection,
    job_id: i64,
    job_types: &[String],
) -> Result<Option<JobRecord>, sqlx::Error> {
    sqlx::query_as::<_, JobRecord>(
        r"
        SELECT *
        FROM job_queue
        WHERE id = $1
          AND state = 'waiting'
          AND scheduled_for <= NOW()
          AND job_type = ANY($2)
        ",
    )
    .bind(job_id)
    .bind(job_types)
    .fetch_optional(conn)
    .await
}

/// Inserts a new waiting job, filling in defaults the caller left unset.
pub(crate) async fn insert_job(pool: &PgPool, job: &NewJob) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO job_queue (job_type, data, scheduled_for, max_attempts)
        VALUES ($1, $2, COALESCE($3, NOW()), $4)
        RETURNING id
        ",
    )
    .bind(&job.job_type)
    .bind(&job.data)
    .bind(job.scheduled_for)
    .bind(job.effective_max_attempts())
    .fetch_one(pool)
    .await
}

/// Marks a waiting job as finished.
///
/// Returns `false` if the job is gone or already left the waiting state.
async fn finish_job(conn: &mut PgConnection, job_id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE job_queue SET state = 'finished', last_run = NOW() WHERE id = $1 AND state = 'waiting'",
    )
    .bind(job_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Puts a waiting job back with a new schedule.
async fn reschedule_job(
    conn: &mut PgConnection,
    job_id: i64,
    scheduled_for: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE job_queue
        SET state = 'waiting', scheduled_for = $2, last_run = NOW()
        WHERE id = $1 AND state = 'waiting'
        ",
    )
    .bind(job_id)
    .bind(scheduled_for)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Deletes a job.
async fn delete_job(conn: &mut PgConnection, job_id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM job_queue WHERE id = $1")
        .bind(job_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Records a failed run of a waiting job.
///
/// The attempt counter is incremented and read back in the same transaction.
/// Once it reaches `max_attempts` the job is marked failed. Otherwise it is
/// rescheduled for `retry_at`, or `backoff` from now.
///
/// Returns the updated row, or `None` if the job was no longer waiting.
async fn record_failure(
    conn: &mut PgConnection,
    job_id: i64,
    message: &str,
    retry_at: Option<DateTime<Utc>>,
    backoff: Duration,
) -> Result<Option<JobRecord>, sqlx::Error> {
    // A savepoint when called inside the claim transaction
    let mut tx = conn.begin().await?;

    let attempts = sqlx::query_as::<_, (i32, i32)>(
        r"
        UPDATE job_queue
        SET last_failure_message = $2, failed_attempts = failed_attempts + 1, last_run = NOW()
        WHERE id = $1 AND state = 'waiting'
        RETURNING failed_attempts, max_attempts
        ",
    )
    .bind(job_id)
    .bind(message)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((failed_attempts, max_attempts)) = attempts else {
        tx.rollback().await?;
        return Ok(None);
    };

    let job = if failed_attempts >= max_attempts {
        sqlx::query_as::<_, JobRecord>(
            "UPDATE job_queue SET state = 'failed' WHERE id = $1 RETURNING *",
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?
    } else {
        sqlx::query_as::<_, JobRecord>(
            r"
            UPDATE job_queue
            SET state = 'waiting', scheduled_for = COALESCE($2, NOW() + make_interval(secs => $3))
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(job_id)
        .bind(retry_at)
        .bind(backoff.as_secs_f64())
        .fetch_one(&mut *tx)
        .await?
    };

    tx.commit().await?;
    Ok(Some(job))
}

/// Looks up a single job.
pub(crate) async fn find_job(pool: &PgPool, job_id: i64) -> Result<Option<JobRecord>, sqlx::Error> {
    sqlx::query_as::<_, JobRecord>("SELECT * FROM job_queue WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

/// All jobs that exhausted their attempts, oldest first.
pub(crate) async fn failed_jobs(pool: &PgPool) -> Result<Vec<JobRecord>, sqlx::Error> {
    sqlx::query_as::<_, JobRecord>("SELECT * FROM job_queue WHERE state = 'failed' ORDER BY id")
        .fetch_all(pool)
        .await
}

/// Every job still stored, oldest first.
pub(crate) async fn all_jobs(pool: &PgPool) -> Result<Vec<JobRecord>, sqlx::Error> {
    sqlx::query_as::<_, JobRecord>("SELECT * FROM job_queue ORDER BY id")
        .fetch_all(pool)
        .await
}

/// The number of jobs waiting to run, including those scheduled in the future
pub(crate) async fn waiting_job_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM job_queue WHERE state = 'waiting'")
        .fetch_one(pool)
        .await
}

/// The number of jobs that exhausted their attempts
pub(crate) async fn failed_job_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM job_queue WHERE state = 'failed'")
        .fetch_one(pool)
        .await
}

/// Deletes every job regardless of state.
pub(crate) async fn delete_all_jobs(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM job_queue").execute(pool).await?;
    Ok(result.rows_affected())
}

pub(crate) async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await?;
    Ok(())
}
