use thiserror::Error;

/// Errors returned when enqueueing a job.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The job payload could not be serialized to JSON.
    #[error("failed to serialize job payload")]
    Serialization(#[from] serde_json::Error),
    /// The insert into the queue table failed.
    #[error("failed to enqueue job")]
    Database(#[from] sqlx::Error),
}

/// Errors raised while registering job kinds.
///
/// These are start-up configuration errors; callers are expected to abort
/// instead of starting workers with a broken catalog.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Two job kinds claimed the same `job_type` identifier.
    #[error("job type `{job_type}` is already registered")]
    Duplicate {
        /// The contested identifier.
        job_type: &'static str,
    },
    /// A job kind declared a retry policy violating the policy invariants.
    #[error("job type `{job_type}` has an invalid retry policy: {reason}")]
    InvalidDefinition {
        /// The offending identifier.
        job_type: &'static str,
        /// Which invariant was violated.
        reason: String,
    },
}
