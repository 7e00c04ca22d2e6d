use crate::registry::JobRegistry;
use crate::schema::QueuedJob;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-execution information handed to a job's handler alongside the payload.
///
/// Constructed fresh for every attempt and never persisted. The `tracing`
/// span surrounding the handler already carries the job id and type, so
/// handler log lines are attributed without extra plumbing.
#[derive(Debug, Clone)]
pub struct JobContext<Context> {
    /// Identifier of the queued job instance.
    pub job_id: i64,
    /// Job kind identifier.
    pub job_type: String,
    /// The attempt currently running, starting at 1.
    pub attempt: i32,
    /// Retry budget of this instance.
    pub max_attempts: i32,
    /// When the instance was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// The application context the runner was constructed with.
    pub app: Context,
}

/// Structured outcome of one execution attempt.
#[derive(Debug, Clone)]
pub struct JobResult {
    /// Whether the attempt completed successfully.
    pub success: bool,
    /// The handler's output value on success.
    pub data: Option<Value>,
    /// Rendered failure message on error, panic, or timeout.
    pub error: Option<String>,
    /// Diagnostic values: `duration_ms` and `attempt`.
    pub metadata: HashMap<String, Value>,
}

impl JobResult {
    fn succeeded(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: HashMap::new(),
        }
    }

    fn failed(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            metadata: HashMap::new(),
        }
    }

    fn with_diagnostics(mut self, duration: Duration, attempt: i32) -> Self {
        self.metadata
            .insert("duration_ms".into(), json!(duration.as_millis() as u64));
        self.metadata.insert("attempt".into(), json!(attempt));
        self
    }
}

/// Executes queued jobs through the registered handlers.
///
/// Owns the job kind registry and converts every handler outcome,
/// including panics and timeouts, into a [`JobResult`]. Nothing a handler
/// does can escape to the worker loop.
pub(crate) struct Executor<Context> {
    registry: Arc<JobRegistry<Context>>,
}

impl<Context: Clone + Send + Sync + 'static> Executor<Context> {
    pub(crate) fn new(registry: Arc<JobRegistry<Context>>) -> Self {
        Self { registry }
    }

    pub(crate) fn registry(&self) -> &JobRegistry<Context> {
        &self.registry
    }

    /// Runs one attempt of `job` and reports the structured outcome.
    pub(crate) async fn execute(&self, app: Context, job: &QueuedJob) -> JobResult {
        let started = Instant::now();

        let outcome = with_sentry_transaction(&job.job_type, || self.invoke(app, job)).await;

        let result = match outcome {
            Ok(data) => JobResult::succeeded(data),
            Err(error) => JobResult::failed(format!("{error:#}")),
        };
        result.with_diagnostics(started.elapsed(), job.attempt)
    }

    async fn invoke(&self, app: Context, job: &QueuedJob) -> anyhow::Result<Value> {
        let Some(registered) = self.registry.get(&job.job_type) else {
            return Err(anyhow!(
                "no handler registered for job type `{}`",
                job.job_type
            ));
        };

        let ctx = JobContext {
            job_id: job.id,
            job_type: job.job_type.clone(),
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            enqueued_at: job.enqueued_at,
            app,
        };

        let invocation = AssertUnwindSafe((registered.run)(ctx, job.data.clone())).catch_unwind();
        let attempt = async move {
            invocation
                .await
                .map_err(|panic| try_to_extract_panic_info(&*panic))
                // TODO: Replace with flatten() once that stabilizes
                .and_then(std::convert::identity)
        };

        match registered.definition.timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(result) => result,
                // The handler future is dropped here; whatever work it had
                // in flight can no longer touch queue state.
                Err(_) => Err(anyhow!("execution exceeded timeout of {limit:?}")),
            },
            None => attempt.await,
        }
    }
}
