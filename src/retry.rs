use std::time::Duration;

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// The same delay before every retry.
    Fixed,
    /// Delay grows proportionally with the attempt number.
    Linear,
    /// Delay doubles after every failed attempt.
    #[default]
    Exponential,
}

/// Retry budget and backoff shape for a job kind.
///
/// The delay computed for any attempt number is clamped to
/// `[initial_delay, max_delay]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of attempts before the job is dead-lettered. At least 1.
    pub max_attempts: i32,
    /// Delay growth strategy.
    pub strategy: BackoffStrategy,
    /// Delay before the first retry, and the lower clamp for all delays.
    pub initial_delay: Duration,
    /// Upper clamp for the computed delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    /// Three attempts with exponential backoff starting at one minute.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: BackoffStrategy::Exponential,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before retrying after `attempt` has failed.
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let attempt = attempt.max(1) as u32;
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.initial_delay,
            BackoffStrategy::Linear => self
                .initial_delay
                .checked_mul(attempt)
                .unwrap_or(self.max_delay),
            BackoffStrategy::Exponential => 2u32
                .checked_pow(attempt - 1)
                .and_then(|factor| self.initial_delay.checked_mul(factor))
                .unwrap_or(self.max_delay),
        };
        delay.clamp(self.initial_delay, self.max_delay)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.max_attempts < 1 {
            return Err(format!(
                "max_attempts must be at least 1, got {}",
                self.max_attempts
            ));
        }
        if self.initial_delay.is_zero() {
            return Err("initial_delay must be greater than zero".into());
        }
        if self.max_delay < self.initial_delay {
            return Err(format!(
                "max_delay {:?} is smaller than initial_delay {:?}",
                self.max_delay, self.initial_delay
            ));
        }
        Ok(())
    }
}
