use crate::dead_letter::DeadLetterSink;
use crate::executor::{Executor, JobResult};
use crate::retry::RetryPolicy;
use crate::schema::QueuedJob;
use crate::storage;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info_span, trace, warn};

pub(crate) struct Worker<Context> {
    pub(crate) connection_pool: PgPool,
    pub(crate) context: Context,
    pub(crate) executor: Arc<Executor<Context>>,
    pub(crate) dead_letter: Arc<dyn DeadLetterSink>,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Process jobs until stopped, or until the queue is empty if
    /// `shutdown_when_queue_empty` is set.
    ///
    /// Stopping is cooperative: the stop flag is checked between ticks, so
    /// an execution already in flight runs to completion.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&mut self) {
        loop {
            if *self.shutdown_rx.borrow() {
                debug!("Stop requested. Shutting down the worker…");
                break;
            }

            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No ready background jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No ready background jobs found. Polling again in {sleep_duration:?}…");
                    if self.sleep_or_stop(sleep_duration).await {
                        break;
                    }
                }
                Err(error) => {
                    // Queue storage unreachable; the next tick polls again.
                    error!("Failed to poll for jobs: {error}");
                    if self.sleep_or_stop(self.sleep_duration_with_jitter()).await {
                        break;
                    }
                }
            }
        }
    }

    /// Sleeps for `duration` unless a stop request arrives first.
    ///
    /// Returns `true` when the worker should shut down.
    async fn sleep_or_stop(&mut self, duration: Duration) -> bool {
        tokio::select! {
            () = sleep(duration) => false,
            changed = self.shutdown_rx.changed() => {
                changed.is_err() || *self.shutdown_rx.borrow()
            }
        }
    }

    /// Run the next ready job in the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if no jobs were ready
    /// - `Err(...)` if there was an error retrieving the job
    #[allow(clippy::cognitive_complexity)]
    async fn run_next_job(&self) -> anyhow::Result<Option<i64>> {
        let context = self.context.clone();
        let pool = &self.connection_pool;

        let job_types = self.executor.registry().job_types();

        trace!("Looking for next ready background job…");

        // Start a transaction to hold the job lock during execution
        let mut tx = pool.begin().await?;

        let job = match storage::find_next_ready_job_tx(&mut tx, &job_types).await {
            Ok(job) => job,
            Err(sqlx::Error::RowNotFound) => {
                tx.rollback().await?;
                return Ok(None);
            }
            Err(e) => {
                tx.rollback().await?;
                return Err(e.into());
            }
        };

        let span = info_span!(
            "job",
            job.id = %job.id,
            job.type = %job.job_type,
            job.attempt = %job.attempt,
        );

        let job_id = job.id;
        debug!(parent: &span, "Running job…");

        let result = self
            .executor
            .execute(context, &job)
            .instrument(span.clone())
            .bind_hub(Hub::current())
            .await;

        let _enter = span.enter();
        if result.success {
            debug!(data = ?result.data, metadata = ?result.metadata, "Job completed");
            storage::delete_successful_job(&mut tx, job_id).await?;
        } else {
            self.handle_failed_attempt(&mut tx, &job, &result).await?;
        }
        tx.commit().await?;

        Ok(Some(job_id))
    }

    /// Requeues a failed job with backoff, or dead-letters it when the
    /// retry budget is exhausted.
    async fn handle_failed_attempt(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: &QueuedJob,
        result: &JobResult,
    ) -> anyhow::Result<()> {
        let error = result.error.as_deref().unwrap_or("unknown error");

        if job.attempt < job.max_attempts {
            let delay = self.retry_policy_for(&job.job_type).delay_for(job.attempt);
            warn!(
                "Job failed on attempt {}/{}, retrying in {delay:?}: {error}",
                job.attempt, job.max_attempts
            );
            storage::requeue_failed_job(tx, job.id, error, delay).await?;
        } else {
            warn!(
                "Job failed permanently after {} attempts: {error}",
                job.attempt
            );
            // Losing a dead-letter record must not stall the queue.
            if let Err(record_error) = self.dead_letter.record(job, error).await {
                warn!("Failed to record dead-lettered job: {record_error}");
            }
            storage::delete_exhausted_job(tx, job.id).await?;
        }

        Ok(())
    }

    /// Backoff shape for a job type, falling back to the default policy
    /// when the type is not registered with this worker.
    fn retry_policy_for(&self, job_type: &str) -> RetryPolicy {
        self.executor
            .registry()
            .get(job_type)
            .map(|registered| registered.definition.retry)
            .unwrap_or_default()
    }
}
