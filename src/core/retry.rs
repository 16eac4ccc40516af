use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a finished command run is classified. Stops are handled by the
/// instance, not here: exit status alone never makes a task fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    TransientFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Every N-th retry sleeps before the next attempt.
    pub max_retry_before_backoff: u32,
    /// Backoff sleep in seconds.
    pub backoff_duration: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_before_backoff: 3,
            backoff_duration: 600,
        }
    }
}

impl RetryPolicy {
    pub fn classify(&self, exit_zero: bool, timed_out: bool) -> Outcome {
        if exit_zero && !timed_out {
            Outcome::Success
        } else {
            Outcome::TransientFailure
        }
    }

    /// Whether the task must sleep before its next attempt, and for how
    /// long. Retries are unbounded; every N-th one backs off.
    pub fn should_backoff(&self, retry_count: u32) -> Option<Duration> {
        if retry_count > 0 && retry_count % self.max_retry_before_backoff == 0 {
            Some(Duration::from_secs(self.backoff_duration))
        } else {
            None
        }
    }
}
