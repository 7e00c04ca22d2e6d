use crate::cleaner::Cleaner;
use crate::dead_letter::{DeadLetterSink, PgDeadLetterSink};
use crate::definition::JobDefinition;
use crate::errors::RegistrationError;
use crate::executor::Executor;
use crate::job::{DEFAULT_QUEUE, Job};
use crate::registry::JobRegistry;
use crate::storage;
use crate::worker::Worker;
use futures_util::future::join_all;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// The core runner responsible for locking and running jobs.
pub struct Runner<Context: Clone + Send + Sync + 'static> {
    connection_pool: PgPool,
    queues: HashMap<String, Queue<Context>>,
    context: Context,
    dead_letter: Arc<dyn DeadLetterSink>,
    dead_letter_retention: Option<Duration>,
    shutdown_when_queue_empty: bool,
    running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send + 'static> std::fmt::Debug for Runner<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .field("context", &self.context)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given connection pool and context.
    ///
    /// Permanently failed jobs go to the `dead_jobs` table unless another
    /// sink is configured with [`Self::dead_letter_sink`].
    pub fn new(connection_pool: PgPool, context: Context) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            dead_letter: Arc::new(PgDeadLetterSink::new(connection_pool.clone())),
            connection_pool,
            queues: HashMap::new(),
            context,
            dead_letter_retention: None,
            shutdown_when_queue_empty: false,
            running: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    /// Register a job kind on the queue named by its `QUEUE` constant.
    ///
    /// Fails when the kind's `JOB_TYPE` is already bound or its retry
    /// policy is invalid; both are start-up configuration errors.
    pub fn register<J: Job<Context = Context>>(mut self) -> Result<Self, RegistrationError> {
        self.queue_entry(J::QUEUE).job_registry.register::<J>()?;
        Ok(self)
    }

    /// Register a job kind and configure its queue in one step.
    pub fn register_with<J, F>(self, config_fn: F) -> Result<Self, RegistrationError>
    where
        J: Job<Context = Context>,
        F: FnOnce(Queue<Context>) -> Queue<Context>,
    {
        Ok(self.register::<J>()?.configure_queue(J::QUEUE, config_fn))
    }

    /// Configure a queue
    pub fn configure_queue(
        mut self,
        queue_name: &str,
        config_fn: impl FnOnce(Queue<Context>) -> Queue<Context>,
    ) -> Self {
        let queue = self.queues.remove(queue_name).unwrap_or_default();
        self.queues.insert(queue_name.into(), config_fn(queue));
        self
    }

    /// Configure the default queue.
    pub fn configure_default_queue(
        self,
        config_fn: impl FnOnce(Queue<Context>) -> Queue<Context>,
    ) -> Self {
        self.configure_queue(DEFAULT_QUEUE, config_fn)
    }

    /// Replace the sink receiving permanently failed jobs.
    pub fn dead_letter_sink(mut self, sink: impl DeadLetterSink + 'static) -> Self {
        self.dead_letter = Arc::new(sink);
        self
    }

    /// Prune dead-lettered jobs older than `retention` in the background.
    ///
    /// The sweeper runs until [`RunHandle::stop`] is called; it does not
    /// participate in `shutdown_when_queue_empty`.
    pub fn dead_letter_retention(mut self, retention: Duration) -> Self {
        self.dead_letter_retention = Some(retention);
        self
    }

    /// Set the runner to shut down when the background job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Definitions of registered kinds that carry a cron schedule.
    ///
    /// External schedule evaluators enqueue instances of these kinds; the
    /// runner itself owns no clock.
    pub fn scheduled_definitions(&self) -> Vec<JobDefinition> {
        self.queues
            .values()
            .flat_map(|queue| queue.job_registry.scheduled_definitions().cloned())
            .collect()
    }

    /// Start the background workers.
    ///
    /// Calling `start` while the runner is already running is a logged
    /// no-op: the returned handle controls the loops started earlier, and
    /// no new ones are spawned. This returns a [`RunHandle`] which can be
    /// used to stop the workers or wait for them to shut down.
    pub fn start(&self) -> RunHandle {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Runner is already running, ignoring start request");
            return self.handle(Vec::new());
        }

        self.shutdown.send_replace(false);

        let mut handles = Vec::new();
        for (queue_name, queue) in &self.queues {
            let executor = Arc::new(Executor::new(Arc::new(queue.job_registry.clone())));

            for i in 1..=queue.num_workers {
                let name = format!("background-worker-{queue_name}-{i}");
                info!(worker.name = %name, "Starting worker…");

                let mut worker = Worker {
                    connection_pool: self.connection_pool.clone(),
                    context: self.context.clone(),
                    executor: executor.clone(),
                    dead_letter: self.dead_letter.clone(),
                    shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                    poll_interval: queue.poll_interval,
                    jitter: queue.jitter,
                    shutdown_rx: self.shutdown.subscribe(),
                };

                let span = info_span!("worker", worker.name = %name);
                let handle = tokio::spawn(async move { worker.run().instrument(span).await });

                handles.push(handle);
            }
        }

        if let Some(retention) = self.dead_letter_retention {
            let cleaner = Cleaner {
                pool: self.connection_pool.clone(),
                retention,
                shutdown_rx: self.shutdown.subscribe(),
            };
            handles.push(cleaner.spawn());
        }

        self.handle(handles)
    }

    fn queue_entry(&mut self, name: &str) -> &mut Queue<Context> {
        self.queues.entry(name.to_string()).or_default()
    }

    fn handle(&self, handles: Vec<JoinHandle<()>>) -> RunHandle {
        RunHandle {
            handles,
            connection_pool: self.connection_pool.clone(),
            running: self.running.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Handle to a running background job processing system.
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    connection_pool: PgPool,
    running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

/// Point-in-time view of the runner for health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Whether the polling loops are active.
    pub is_running: bool,
    /// Approximate number of jobs not yet completed.
    pub queue_size: i64,
}

impl RunHandle {
    /// Stop polling for new jobs.
    ///
    /// Cooperative: ticks scheduled after this call are skipped, while an
    /// execution already in flight runs to completion. Calling `stop` on a
    /// stopped runner is a no-op.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("Runner is already stopped");
            return;
        }
        self.shutdown.send_replace(true);
    }

    /// Whether the polling loops are active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Reports whether the runner is active and how many jobs are pending.
    ///
    /// The queue size is approximate under concurrent mutation.
    pub async fn status(&self) -> Result<Status, sqlx::Error> {
        Ok(Status {
            is_running: self.is_running(),
            queue_size: storage::queue_size(&self.connection_pool).await?,
        })
    }

    /// Wait for all background workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Configuration and state for a job queue
#[derive(Debug)]
pub struct Queue<Context: Clone + Send + Sync + 'static> {
    pub(crate) job_registry: JobRegistry<Context>,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
}

impl<Context: Clone + Send + Sync + 'static> Default for Queue<Context> {
    fn default() -> Self {
        Self {
            job_registry: JobRegistry::default(),
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static> Queue<Context> {
    /// Set the number of worker tasks for this queue.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }
}
