use crate::job::Job;
use crate::retry::RetryPolicy;
use std::time::Duration;

/// Dequeue priority of a job. Higher priorities are dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    /// Runs after everything else.
    Low,
    /// The default priority.
    #[default]
    Normal,
    /// Runs before `Normal` and `Low` jobs.
    High,
    /// Runs before everything else.
    Urgent,
}

impl Priority {
    /// The `SMALLINT` value stored in the `priority` column.
    pub const fn as_i16(self) -> i16 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 10,
            Priority::High => 20,
            Priority::Urgent => 30,
        }
    }

    /// Maps a stored column value back to the closest priority level.
    pub const fn from_i16(value: i16) -> Self {
        match value {
            v if v >= 30 => Priority::Urgent,
            v if v >= 20 => Priority::High,
            v if v >= 10 => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

/// Immutable catalog entry describing one job kind.
///
/// Built from the [`Job`] trait constants when the kind is registered and
/// kept by the registry for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    /// Unique job kind identifier.
    pub job_type: &'static str,
    /// Human-readable name, defaults to the type identifier.
    pub name: &'static str,
    /// Optional five-field cron expression.
    ///
    /// Catalog metadata for an external schedule evaluator; the worker
    /// never interprets it.
    pub schedule: Option<&'static str>,
    /// Retry budget and backoff shape for failed attempts.
    pub retry: RetryPolicy,
    /// Wall-clock limit for one execution attempt. `None` means unbounded.
    pub timeout: Option<Duration>,
    /// Default dequeue priority for instances of this kind.
    pub priority: Priority,
}

impl JobDefinition {
    pub(crate) fn of<J: Job>() -> Self {
        Self {
            job_type: J::JOB_TYPE,
            name: J::NAME,
            schedule: J::SCHEDULE,
            retry: J::retry_policy(),
            timeout: J::TIMEOUT,
            priority: J::PRIORITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_levels_are_ordered() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Urgent);
    }

    #[test]
    fn priority_round_trips_through_column_values() {
        for priority in [
            Priority::Low,
            Priority::Normal,
            Priority::High,
            Priority::Urgent,
        ] {
            assert_eq!(Priority::from_i16(priority.as_i16()), priority);
        }
    }
}
