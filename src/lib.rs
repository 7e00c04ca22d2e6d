#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod cleaner;
mod dead_letter;
mod definition;
mod errors;
mod executor;
mod job;
mod registry;
mod retry;
mod runner;
/// Database schema definitions.
pub mod schema;
mod storage;
mod util;
mod worker;

/// Dead-letter sink contract and the default Postgres-backed sink.
pub use self::dead_letter::{DeadLetterSink, PgDeadLetterSink};
/// Catalog entry and priority levels for job kinds.
pub use self::definition::{JobDefinition, Priority};
/// Error types for registration and enqueue operations.
pub use self::errors::{EnqueueError, RegistrationError};
/// Per-execution context and structured attempt outcome.
pub use self::executor::{JobContext, JobResult};
/// The main trait for defining background jobs.
pub use self::job::{DEFAULT_QUEUE, Job};
/// Retry budget and backoff configuration.
pub use self::retry::{BackoffStrategy, RetryPolicy};
/// The runner that orchestrates job processing.
pub use self::runner::{Queue, RunHandle, Runner, Status};
/// Dead-letter inspection and database setup helpers.
pub use self::storage::{dead_job_count, list_dead_jobs, retry_dead_job, setup_database};
