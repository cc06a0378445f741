//! Retry and timeout budget shared by every pipeline stage.
//!
//! Components never keep their own retry counters; they read the attempt
//! counts and deadlines from the [`ExecutionBudget`] they were built with.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff with a cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Creates a new backoff starting at `initial`, capping at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the current interval.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the current interval and advances to the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Resets to the initial interval.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Timeouts and retry counts for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionBudget {
    /// Per-call timeout for the text-generation backend.
    pub generation_timeout: Duration,
    /// Corrective retries per generation slot.
    pub generation_retries: u32,
    /// Timeout for a codebase search call.
    pub search_timeout: Duration,
    /// Wall-clock limit for one sandbox test run.
    pub sandbox_timeout: Duration,
    /// Retries per candidate after a sandbox infrastructure error.
    pub sandbox_retries: u32,
    /// Timeout for the post-apply smoke check.
    pub smoke_timeout: Duration,
    /// Timeout for the optional sandbox lint step.
    pub lint_timeout: Duration,
    /// Limit for a whole request, generation through proposal creation.
    pub request_timeout: Duration,
    /// How long a deployment waits for overlapping locks to clear.
    pub lock_wait: Duration,
    /// First lock re-check interval.
    pub lock_backoff_initial: Duration,
    /// Upper bound for the lock re-check interval.
    pub lock_backoff_max: Duration,
}

impl Default for ExecutionBudget {
    fn default() -> Self {
        Self {
            generation_timeout: Duration::from_secs(120),
            generation_retries: 1,
            search_timeout: Duration::from_secs(10),
            sandbox_timeout: Duration::from_secs(600),
            sandbox_retries: 1,
            smoke_timeout: Duration::from_secs(120),
            lint_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(3600),
            lock_wait: Duration::from_secs(300),
            lock_backoff_initial: Duration::from_millis(50),
            lock_backoff_max: Duration::from_secs(5),
        }
    }
}

impl ExecutionBudget {
    /// Total attempts a generation slot may make.
    pub fn generation_attempts(&self) -> u32 {
        1 + self.generation_retries
    }

    /// Total sandbox runs a candidate may get.
    pub fn sandbox_attempts(&self) -> u32 {
        1 + self.sandbox_retries
    }

    /// Backoff used while a deployment is deferred on a lock.
    pub fn lock_backoff(&self) -> Backoff {
        Backoff::new(self.lock_backoff_initial, self.lock_backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_starts_at_initial() {
        let backoff = Backoff::new(Duration::from_millis(50), Duration::from_secs(5));
        assert_eq!(backoff.current(), Duration::from_millis(50));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.current(), Duration::from_secs(5));
    }

    #[test]
    fn backoff_resets_to_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
    }

    #[test]
    fn default_budget_allows_one_retry_each() {
        let budget = ExecutionBudget::default();
        assert_eq!(budget.generation_attempts(), 2);
        assert_eq!(budget.sandbox_attempts(), 2);
    }
}
