//! Retry policy: attempt budget plus a caller-supplied delay schedule.
//!
//! Semantics:
//! - `max_attempts` counts total deliveries (first delivery + retries).
//! - `delay_schedule[i]` is the wait before delivery `i + 2`; attempts past the end of the
//!   schedule reuse the last entry.
//! - Delays are not computed here; curve selection belongs to whoever builds the schedule.
//!
//! Invariants:
//! - `max_attempts >= 1`.
//! - `delay_schedule` is non-empty.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use requeue::{RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .delays([Duration::from_millis(100), Duration::from_millis(200)])
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(
//!     policy.decide(0),
//!     RetryDecision::Retry { attempt: 1, delay: Duration::from_millis(100) }
//! );
//! assert_eq!(policy.decide(2), RetryDecision::DeadLetter { attempt: 3 });
//! ```

use std::time::Duration;

/// Immutable retry policy supplied at wiring time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay_schedule: Vec<Duration>,
}

/// What to do with a message whose handler just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Settle the original and schedule a clone after `delay`.
    Retry {
        /// The attempt that just failed (1-indexed).
        attempt: u32,
        delay: Duration,
    },
    /// The budget is spent; move the message to the dead-letter queue.
    DeadLetter {
        /// The attempt that just failed (1-indexed).
        attempt: u32,
    },
}

impl RetryPolicy {
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Shorthand for `builder().max_attempts(..).delays(..).build()`.
    pub fn new<I>(max_attempts: u32, delays: I) -> Result<Self, BuildError>
    where
        I: IntoIterator<Item = Duration>,
    {
        Self::builder().max_attempts(max_attempts).delays(delays).build()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_schedule(&self) -> &[Duration] {
        &self.delay_schedule
    }

    /// Delay applied before the delivery that follows failed attempt `current_attempt`.
    ///
    /// `current_attempt` is 1-indexed; indexes past the schedule clamp to the last entry.
    pub fn delay_for(&self, current_attempt: u32) -> Duration {
        let last = self.delay_schedule.len().saturating_sub(1);
        let index = (current_attempt.saturating_sub(1) as usize).min(last);
        self.delay_schedule.get(index).copied().unwrap_or_default()
    }

    /// Decide the fate of a message that has `completed_attempts` recorded failures and just
    /// failed again.
    pub fn decide(&self, completed_attempts: u32) -> RetryDecision {
        let attempt = completed_attempts.saturating_add(1);
        if attempt >= self.max_attempts {
            RetryDecision::DeadLetter { attempt }
        } else {
            RetryDecision::Retry { attempt, delay: self.delay_for(attempt) }
        }
    }
}

/// Builder for `RetryPolicy`.
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: u32,
    delay_schedule: Vec<Duration>,
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// `max_attempts` must be > 0.
    InvalidMaxAttempts(u32),
    /// At least one delay is required.
    EmptyDelaySchedule,
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::InvalidMaxAttempts(n) => {
                write!(f, "max_attempts must be > 0 (got {})", n)
            }
            BuildError::EmptyDelaySchedule => write!(f, "delay schedule must not be empty"),
        }
    }
}

impl std::error::Error for BuildError {}

impl RetryPolicyBuilder {
    /// Create a builder with three attempts and no delays yet.
    pub fn new() -> Self {
        Self { max_attempts: 3, delay_schedule: Vec::new() }
    }

    /// Set total attempts (first delivery + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Append one delay to the schedule.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay_schedule.push(delay);
        self
    }

    /// Replace the schedule.
    pub fn delays<I>(mut self, delays: I) -> Self
    where
        I: IntoIterator<Item = Duration>,
    {
        self.delay_schedule = delays.into_iter().collect();
        self
    }

    /// Replace the schedule with millisecond values, the unit used on the wire.
    pub fn delays_ms<I>(self, delays: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        self.delays(delays.into_iter().map(Duration::from_millis))
    }

    /// Build the retry policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        if self.delay_schedule.is_empty() {
            return Err(BuildError::EmptyDelaySchedule);
        }
        Ok(RetryPolicy { max_attempts: self.max_attempts, delay_schedule: self.delay_schedule })
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
