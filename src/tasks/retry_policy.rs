//! Retry policy for failed task attempts.
//!
//! Failed tasks are re-queued at the back of the queue without delay; the
//! policy only decides whether another attempt is allowed.

use crate::config::SchedulerSettings;
use crate::tasks::TaskError;

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue the task. Carries the budget left after this retry.
    Retry { remaining: u32 },
    /// Persist the task as failed.
    Fail,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries granted after the first attempt.
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Create a new RetryPolicy from configuration settings.
    pub fn new(config: &SchedulerSettings) -> Self {
        Self {
            max_retries: config.max_retries,
        }
    }

    /// Budget a freshly queued task starts with.
    pub fn initial_budget(&self) -> u32 {
        self.max_retries
    }

    /// Decide what happens to a task whose attempt failed with `error` while
    /// `remaining` retries were left.
    ///
    /// Terminal error kinds fail immediately regardless of the budget.
    pub fn decide(&self, error: &TaskError, remaining: u32) -> RetryDecision {
        if error.is_retryable() && remaining > 0 {
            RetryDecision::Retry {
                remaining: remaining - 1,
            }
        } else {
            RetryDecision::Fail
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&SchedulerSettings::default())
    }
}
