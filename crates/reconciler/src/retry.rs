//! Retry logic with exponential backoff and jitter.
//!
//! Only transient failures are retried; permanent errors, conflicts, and
//! not-found are returned on first sight so the caller can apply its own
//! policy. Sleeps go through the [`PassContext`], so a retry loop never
//! outlives its pass.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::duration_ms;
use crate::context::{CallError, PassContext};

const DEFAULT_MAX_ATTEMPTS: u32 = 4;
const DEFAULT_INITIAL_DELAY_MS: u64 = 200;
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Configuration for bounded retries of transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one (minimum 1).
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    /// Cap on the delay between retries.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Extra random delay as a fraction of the computed delay (0.0 - 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            backoff_multiplier: 2.0,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Set the total number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the initial delay.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor.
    #[must_use]
    pub const fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Delay before retry number `retry` (0-indexed), without jitter.
    ///
    /// `initial_delay * multiplier^retry`, capped at `max_delay`.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(scaled).unwrap_or(self.max_delay)
    }

    /// Delay before retry number `retry` with jitter added.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter_factor <= 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter_factor.min(1.0);
        let jitter = rand::thread_rng().gen_range(0.0..=spread);
        base.saturating_add(Duration::try_from_secs_f64(jitter).unwrap_or(Duration::ZERO))
    }
}

/// Run a remote call, retrying transient failures with backoff.
///
/// # Errors
///
/// Returns the first non-transient error, the last transient error once
/// `max_attempts` is exhausted, or the interrupt that stopped the pass.
pub async fn retry_transient<T, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    ctx: &PassContext,
    mut operation: F,
) -> Result<T, CallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, crate::client::ApiError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);

        match ctx.call(operation()).await {
            Ok(value) => return Ok(value),
            Err(CallError::Api(e)) if e.is_transient() => {
                if attempt >= max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(CallError::Api(e));
                }

                let delay = config.delay_for(attempt.saturating_sub(1));
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );
                ctx.sleep(delay).await?;
            }
            Err(e) => return Err(e),
        }
    }
}
