use crate::definition::Priority;
use crate::errors::EnqueueError;
use crate::schema::{DeadJob, QueuedJob};
use serde_json::Value;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;

static MIGRATOR: Migrator = sqlx::migrate!();

/// Creates the `background_jobs` and `dead_jobs` tables by running the
/// crate's embedded migrations.
pub async fn setup_database(pool: &PgPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

fn delay_millis(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
}

/// Inserts a job row, ready after the optional delay has elapsed.
pub(crate) async fn enqueue_simple(
    pool: &PgPool,
    job_type: &str,
    data: Value,
    priority: Priority,
    max_attempts: i32,
    delay: Option<Duration>,
) -> Result<i64, EnqueueError> {
    let id = sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO background_jobs (job_type, data, priority, max_attempts, not_before_at)
        VALUES ($1, $2, $3, $4, NOW() + $5 * INTERVAL '1 millisecond')
        RETURNING id
        ",
    )
    .bind(job_type)
    .bind(data)
    .bind(priority.as_i16())
    .bind(max_attempts)
    .bind(delay.map_or(0, delay_millis))
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// Inserts a job row unless an identical unstarted job already exists.
pub(crate) async fn enqueue_deduplicated(
    pool: &PgPool,
    job_type: &str,
    data: Value,
    priority: Priority,
    max_attempts: i32,
    delay: Option<Duration>,
) -> Result<Option<i64>, EnqueueError> {
    // Try to insert only if no similar job exists (not locked)
    let result = sqlx::query_scalar::<_, Option<i64>>(
        r"
        INSERT INTO background_jobs (job_type, data, priority, max_attempts, not_before_at)
        SELECT $1, $2, $3, $4, NOW() + $5 * INTERVAL '1 millisecond'
        WHERE NOT EXISTS (
            SELECT 1 FROM background_jobs
            WHERE job_type = $1 AND data = $2 AND priority = $3
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id
        ",
    )
    .bind(job_type)
    .bind(data)
    .bind(priority.as_i16())
    .bind(max_attempts)
    .bind(delay.map_or(0, delay_millis))
    .fetch_optional(pool)
    .await?;

    Ok(result.flatten())
}

/// Inserts a batch of job rows in one statement, returning their ids in
/// input order.
pub(crate) async fn enqueue_batch(
    pool: &PgPool,
    job_type: &str,
    payloads: Vec<Value>,
    priority: Priority,
    max_attempts: i32,
) -> Result<Vec<i64>, EnqueueError> {
    if payloads.is_empty() {
        return Ok(Vec::new());
    }

    let ids = sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO background_jobs (job_type, data, priority, max_attempts)
        SELECT $1, t.payload, $3, $4 FROM UNNEST($2::JSONB[]) AS t(payload)
        RETURNING id
        ",
    )
    .bind(job_type)
    .bind(payloads)
    .bind(priority.as_i16())
    .bind(max_attempts)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

/// Finds the next ready job and locks it for the rest of the transaction.
///
/// Only rows whose `not_before_at` has elapsed are visible; highest
/// priority first, FIFO within equal priority. `SKIP LOCKED` keeps
/// concurrently polling workers from receiving the same row.
pub(crate) async fn find_next_ready_job_tx(
    tx: &mut Transaction<'_, Postgres>,
    job_types: &[String],
) -> Result<QueuedJob, sqlx::Error> {
    sqlx::query_as::<_, QueuedJob>(
        r"
        SELECT id, job_type, data, attempt, max_attempts, priority,
               enqueued_at, not_before_at, last_error
        FROM background_jobs
        WHERE job_type = ANY($1)
          AND not_before_at <= NOW()
        ORDER BY priority DESC, id ASC
        FOR UPDATE SKIP LOCKED
        LIMIT 1
        ",
    )
    .bind(job_types)
    .fetch_one(&mut **tx)
    .await
}

/// Deletes a job that has successfully completed running.
pub(crate) async fn delete_successful_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM background_jobs WHERE id = $1")
        .bind(job_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Re-schedules a failed job for another attempt.
///
/// Bumps the attempt counter, records the failure message, and pushes the
/// readiness gate `delay` into the future. Priority is left untouched.
pub(crate) async fn requeue_failed_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
    error: &str,
    delay: Duration,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        UPDATE background_jobs
        SET attempt = attempt + 1,
            last_error = $2,
            not_before_at = NOW() + $3 * INTERVAL '1 millisecond'
        WHERE id = $1
        ",
    )
    .bind(job_id)
    .bind(error)
    .bind(delay_millis(delay))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Removes a job whose retry budget is exhausted from the queue.
pub(crate) async fn delete_exhausted_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM background_jobs WHERE id = $1")
        .bind(job_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Copies a job into the dead-letter table.
///
/// Inserting the same job id twice is a no-op, so a retried hand-off after
/// a failed commit cannot produce duplicate records.
pub(crate) async fn insert_dead_job(
    pool: &PgPool,
    job: &QueuedJob,
    final_error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO dead_jobs (id, job_type, data, attempt, max_attempts,
                               priority, enqueued_at, final_error)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (id) DO NOTHING
        ",
    )
    .bind(job.id)
    .bind(&job.job_type)
    .bind(&job.data)
    .bind(job.attempt)
    .bind(job.max_attempts)
    .bind(job.priority)
    .bind(job.enqueued_at)
    .bind(final_error)
    .execute(pool)
    .await?;
    Ok(())
}

/// Approximate number of jobs not yet completed.
pub(crate) async fn queue_size(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM background_jobs")
        .fetch_one(pool)
        .await
}

/// Number of dead-lettered jobs.
pub async fn dead_job_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dead_jobs")
        .fetch_one(pool)
        .await
}

/// Fetches dead-lettered jobs for operator inspection, newest first.
pub async fn list_dead_jobs(
    pool: &PgPool,
    job_type: Option<&str>,
    limit: Option<i64>,
) -> Result<Vec<DeadJob>, sqlx::Error> {
    let mut query = "SELECT id, job_type, data, attempt, max_attempts, priority, enqueued_at, final_error, dead_at FROM dead_jobs".to_string();

    if job_type.is_some() {
        query.push_str(" WHERE job_type = $1");
    }

    query.push_str(" ORDER BY dead_at DESC");

    if limit.is_some() {
        if job_type.is_some() {
            query.push_str(" LIMIT $2");
        } else {
            query.push_str(" LIMIT $1");
        }
    }

    let mut query_builder = sqlx::query_as::<_, DeadJob>(&query);

    if let Some(job_type_val) = job_type {
        query_builder = query_builder.bind(job_type_val);
    }

    if let Some(limit_val) = limit {
        query_builder = query_builder.bind(limit_val);
    }

    query_builder.fetch_all(pool).await
}

/// Puts a dead-lettered job back on the queue with a fresh attempt counter.
///
/// Returns `false` when no dead-lettered job with that id exists.
pub async fn retry_dead_job(pool: &PgPool, job_id: i64) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let reinserted = sqlx::query(
        r"
        INSERT INTO background_jobs (job_type, data, attempt, max_attempts, priority, enqueued_at)
        SELECT job_type, data, 1, max_attempts, priority, NOW()
        FROM dead_jobs
        WHERE id = $1
        ",
    )
    .bind(job_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    sqlx::query("DELETE FROM dead_jobs WHERE id = $1")
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(reinserted > 0)
}

/// Deletes dead-lettered jobs older than `retention`, returning how many
/// rows were removed.
pub(crate) async fn prune_dead_jobs(
    pool: &PgPool,
    retention: Duration,
) -> Result<u64, sqlx::Error> {
    let result =
        sqlx::query("DELETE FROM dead_jobs WHERE dead_at < NOW() - $1 * INTERVAL '1 millisecond'")
            .bind(delay_millis(retention))
            .execute(pool)
            .await?;
    Ok(result.rows_affected())
}
