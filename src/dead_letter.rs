use crate::schema::QueuedJob;
use crate::storage;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sqlx::PgPool;

/// One-way sink that durably records permanently failed jobs.
///
/// The worker calls [`record`](Self::record) exactly once per job that
/// exhausts its retry budget. Errors are logged and swallowed by the
/// worker; implementations must not block job processing.
pub trait DeadLetterSink: Send + Sync {
    /// Record `job` together with the error that exhausted its retries.
    fn record<'a>(
        &'a self,
        job: &'a QueuedJob,
        final_error: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// The default sink, backed by the `dead_jobs` table.
///
/// Entries can be inspected with [`list_dead_jobs`](crate::list_dead_jobs)
/// and re-admitted with [`retry_dead_job`](crate::retry_dead_job).
#[derive(Debug, Clone)]
pub struct PgDeadLetterSink {
    pool: PgPool,
}

impl PgDeadLetterSink {
    /// Creates a sink writing to `dead_jobs` through `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl DeadLetterSink for PgDeadLetterSink {
    fn record<'a>(
        &'a self,
        job: &'a QueuedJob,
        final_error: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            storage::insert_dead_job(&self.pool, job, final_error).await?;
            Ok(())
        }
        .boxed()
    }
}
