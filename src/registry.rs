use crate::definition::JobDefinition;
use crate::errors::RegistrationError;
use crate::executor::JobContext;
use crate::job::Job;
use anyhow::anyhow;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

type RunTaskFn<Context> =
    Arc<dyn Fn(JobContext<Context>, Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// A job kind as the registry holds it: its catalog entry plus the erased
/// handler invocation function.
pub(crate) struct RegisteredJob<Context> {
    pub(crate) definition: JobDefinition,
    pub(crate) run: RunTaskFn<Context>,
}

impl<Context> Clone for RegisteredJob<Context> {
    fn clone(&self) -> Self {
        Self {
            definition: self.definition.clone(),
            run: Arc::clone(&self.run),
        }
    }
}

/// Maps job kind identifiers to their definitions and handlers.
///
/// Filled during start-up and shared read-only with the workers afterwards,
/// so lookups require no locking.
pub(crate) struct JobRegistry<Context> {
    job_types: HashMap<&'static str, RegisteredJob<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            job_types: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            job_types: self.job_types.clone(),
        }
    }
}

impl<Context> std::fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> JobRegistry<Context> {
    /// Bind a job kind to the registry.
    pub(crate) fn register<J: Job<Context = Context>>(&mut self) -> Result<(), RegistrationError> {
        let definition = JobDefinition::of::<J>();
        definition
            .retry
            .validate()
            .map_err(|reason| RegistrationError::InvalidDefinition {
                job_type: J::JOB_TYPE,
                reason,
            })?;

        if self.job_types.contains_key(J::JOB_TYPE) {
            return Err(RegistrationError::Duplicate {
                job_type: J::JOB_TYPE,
            });
        }

        self.job_types.insert(
            J::JOB_TYPE,
            RegisteredJob {
                definition,
                run: Arc::new(runnable::<J>),
            },
        );
        Ok(())
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&RegisteredJob<Context>> {
        self.job_types.get(job_type)
    }

    pub(crate) fn job_types(&self) -> Vec<String> {
        self.job_types.keys().map(|name| (*name).to_string()).collect()
    }

    /// Definitions carrying a cron schedule, for external trigger evaluation.
    pub(crate) fn scheduled_definitions(&self) -> impl Iterator<Item = &JobDefinition> {
        self.job_types
            .values()
            .map(|registered| &registered.definition)
            .filter(|definition| definition.schedule.is_some())
    }
}

fn runnable<J: Job>(
    ctx: JobContext<J::Context>,
    payload: Value,
) -> BoxFuture<'static, anyhow::Result<Value>> {
    async move {
        let job: J = serde_json::from_value(payload)
            .map_err(|err| anyhow!("invalid payload for job type `{}`: {err}", J::JOB_TYPE))?;
        job.run(ctx).await
    }
    .boxed()
}
