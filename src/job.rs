use crate::definition::Priority;
use crate::errors::EnqueueError;
use crate::executor::JobContext;
use crate::retry::RetryPolicy;
use crate::storage;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::PgPool;
use std::future::Future;
use std::time::Duration;
use tracing::instrument;

/// The default queue name used when no specific queue is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
///
/// The implementing type is the job's payload: it is serialized into the
/// queue on enqueue and deserialized back before [`Self::run`] is invoked,
/// so every handler receives a strongly shaped payload.
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique identifier of the job kind.
    ///
    /// This MUST be unique for the whole application.
    const JOB_TYPE: &'static str;

    /// Human-readable name of the job kind.
    const NAME: &'static str = Self::JOB_TYPE;

    /// Default priority for instances of this kind.
    ///
    /// [`Self::enqueue_with_priority`] can be used to override the value
    /// per instance.
    const PRIORITY: Priority = Priority::Normal;

    /// Optional five-field cron expression for kinds that run on a schedule.
    ///
    /// Catalog metadata for an external schedule evaluator; the worker
    /// never interprets it.
    const SCHEDULE: Option<&'static str> = None;

    /// Wall-clock limit for a single execution attempt.
    ///
    /// When the limit elapses the attempt is abandoned and counts as a
    /// failure. `None` leaves the attempt unbounded.
    const TIMEOUT: Option<Duration> = None;

    /// Whether the job should be deduplicated.
    ///
    /// If true, the job will not be enqueued if there is already an
    /// unstarted job with the same data.
    const DEDUPLICATED: bool = false;

    /// Job queue where this job will be executed.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// Retry budget and backoff shape for failed attempts.
    fn retry_policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + Sync + 'static;

    /// Execute the task. This method should define its logic.
    ///
    /// The returned value is carried in the attempt's
    /// [`JobResult`](crate::JobResult) and logged on completion. Errors are
    /// retried according to [`Self::retry_policy`]. Side effects should be
    /// idempotent: a timed-out attempt may still finish its work after the
    /// worker has stopped waiting for it.
    fn run(
        &self,
        ctx: JobContext<Self::Context>,
    ) -> impl Future<Output = anyhow::Result<Value>> + Send;

    /// Enqueue this job for background execution.
    ///
    /// Returns the job ID if successfully enqueued, or `None` if deduplicated.
    #[instrument(name = "conveyor.enqueue", skip(self, pool), fields(message = Self::JOB_TYPE))]
    fn enqueue<'a>(&'a self, pool: &'a PgPool) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
        self.enqueue_with_priority(pool, Self::PRIORITY)
    }

    /// Enqueue this job with a priority overriding the kind's default.
    #[instrument(name = "conveyor.enqueue", skip(self, pool), fields(message = Self::JOB_TYPE))]
    fn enqueue_with_priority<'a>(
        &'a self,
        pool: &'a PgPool,
        priority: Priority,
    ) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
        let data = match serde_json::to_value(self) {
            Ok(data) => data,
            Err(err) => return async move { Err(EnqueueError::Serialization(err)) }.boxed(),
        };

        dispatch_enqueue(
            pool,
            Self::JOB_TYPE,
            Self::DEDUPLICATED,
            data,
            priority,
            Self::retry_policy().max_attempts,
            None,
        )
    }

    /// Enqueue this job so it becomes ready only after `delay` has elapsed.
    ///
    /// Workers will not dequeue the job before that moment.
    #[instrument(name = "conveyor.enqueue", skip(self, pool), fields(message = Self::JOB_TYPE))]
    fn enqueue_delayed<'a>(
        &'a self,
        pool: &'a PgPool,
        delay: Duration,
    ) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
        let data = match serde_json::to_value(self) {
            Ok(data) => data,
            Err(err) => return async move { Err(EnqueueError::Serialization(err)) }.boxed(),
        };

        dispatch_enqueue(
            pool,
            Self::JOB_TYPE,
            Self::DEDUPLICATED,
            data,
            Self::PRIORITY,
            Self::retry_policy().max_attempts,
            Some(delay),
        )
    }

    /// Enqueue a batch of jobs.
    ///
    /// Returns one entry per input job, `None` where deduplication
    /// suppressed the insert.
    #[instrument(name = "conveyor.enqueue_batch", skip(jobs, pool), fields(message = Self::JOB_TYPE))]
    fn enqueue_batch<'a>(
        jobs: &'a [Self],
        pool: &'a PgPool,
    ) -> BoxFuture<'a, Result<Vec<Option<i64>>, EnqueueError>>
    where
        Self: Sized,
    {
        async move {
            if Self::DEDUPLICATED {
                let mut ids = Vec::with_capacity(jobs.len());
                for job in jobs {
                    ids.push(job.enqueue(pool).await?);
                }
                return Ok(ids);
            }

            let mut payloads = Vec::with_capacity(jobs.len());
            for job in jobs {
                payloads.push(serde_json::to_value(job)?);
            }

            let max_attempts = Self::retry_policy().max_attempts;
            let ids = storage::enqueue_batch(
                pool,
                Self::JOB_TYPE,
                payloads,
                Self::PRIORITY,
                max_attempts,
            )
            .await?;
            Ok(ids.into_iter().map(Some).collect())
        }
        .boxed()
    }
}

fn dispatch_enqueue<'a>(
    pool: &'a PgPool,
    job_type: &'static str,
    deduplicated: bool,
    data: Value,
    priority: Priority,
    max_attempts: i32,
    delay: Option<Duration>,
) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
    if deduplicated {
        storage::enqueue_deduplicated(pool, job_type, data, priority, max_attempts, delay).boxed()
    } else {
        let future = storage::enqueue_simple(pool, job_type, data, priority, max_attempts, delay);
        async move { Ok(Some(future.await?)) }.boxed()
    }
}
