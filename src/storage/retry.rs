//! Bounded retry with exponential backoff.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{BackendError, Result, SealvaultError};

/// How a backend retries transient failures.
///
/// Permanent failures are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least one is always made.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 25,
            max_backoff_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// A single attempt. Failures surface immediately.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Run `op`, retrying transient backend errors.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> std::result::Result<T, BackendError>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient backend failure, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(SealvaultError::Backend(err)),
            }
        }
    }
}
