//! Verification probe.
//!
//! Polls the remote client until a predicate over the observed state holds,
//! so both synchronous and eventually-consistent backends converge the same
//! way. A single failed read is "not yet"; only a run of consecutive
//! failures aborts the probe early.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::client::{ApiError, BackendServiceClient};
use crate::config::duration_ms;
use crate::context::{CallError, Interrupt, PassContext};
use crate::diff::diff;
use crate::types::{ObservedState, ResolvedState};

/// Backoff and failure tolerance for probing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Wait after the first unsatisfied read.
    #[serde(with = "duration_ms")]
    pub initial_interval: Duration,
    /// Cap on the wait between reads.
    #[serde(with = "duration_ms")]
    pub max_interval: Duration,
    /// Growth factor of the wait between reads.
    pub multiplier: f64,
    /// Consecutive failed reads tolerated before giving up.
    pub max_consecutive_failures: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            multiplier: 1.5,
            max_consecutive_failures: 5,
        }
    }
}

impl ProbeConfig {
    /// Set the interval bounds.
    #[must_use]
    pub const fn with_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_interval = initial;
        self.max_interval = max;
        self
    }

    /// Set the consecutive failure budget.
    #[must_use]
    pub const fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures;
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        let grown = current.as_secs_f64() * self.multiplier;
        if grown >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::try_from_secs_f64(grown).unwrap_or(self.max_interval)
        }
    }
}

/// Why a probe stopped without its predicate holding.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProbeError {
    #[error("'{name}' did not converge within {}ms", .elapsed.as_millis())]
    Timeout {
        name: String,
        elapsed: Duration,
        last_observed: Option<Box<ObservedState>>,
    },

    #[error("probe of '{name}' gave up after {failures} consecutive failed reads: {last_error}")]
    Unavailable {
        name: String,
        failures: u32,
        last_error: ApiError,
        last_observed: Option<Box<ObservedState>>,
    },

    #[error("probe of '{name}' interrupted: {interrupt}")]
    Interrupted {
        name: String,
        interrupt: Interrupt,
        last_observed: Option<Box<ObservedState>>,
    },
}

impl ProbeError {
    /// The last representation the probe saw, if any.
    pub fn last_observed(&self) -> Option<&ObservedState> {
        match self {
            Self::Timeout { last_observed, .. }
            | Self::Unavailable { last_observed, .. }
            | Self::Interrupted { last_observed, .. } => last_observed.as_deref(),
        }
    }

    /// Take ownership of the last representation.
    pub fn into_last_observed(self) -> Option<ObservedState> {
        match self {
            Self::Timeout { last_observed, .. }
            | Self::Unavailable { last_observed, .. }
            | Self::Interrupted { last_observed, .. } => last_observed.map(|b| *b),
        }
    }
}

/// Predicate: the resource exists.
pub fn present(observed: Option<&ObservedState>) -> bool {
    observed.is_some()
}

/// Predicate: the resource is gone.
pub fn absent(observed: Option<&ObservedState>) -> bool {
    observed.is_none()
}

/// Predicate: the resource exists with a fingerprint other than `previous`.
pub fn fingerprint_changed(previous: &str) -> impl Fn(Option<&ObservedState>) -> bool + '_ {
    move |observed| observed.is_some_and(|o| o.fingerprint != previous)
}

/// Predicate: the resource exists and shows no drift from `desired`.
pub fn matches(desired: &ResolvedState) -> impl Fn(Option<&ObservedState>) -> bool + '_ {
    move |observed| observed.is_some_and(|o| diff(desired, o).is_empty())
}

/// Poll `client.get(name)` until `predicate` holds or `timeout` elapses.
///
/// Returns the satisfying observation (`None` when the predicate was
/// satisfied by absence). Each read is bounded by the time left plus the
/// current interval, so the probe never waits past `timeout` plus one
/// interval however slow the backend is.
///
/// # Errors
///
/// - [`ProbeError::Timeout`] when the predicate never held in time
/// - [`ProbeError::Unavailable`] after `max_consecutive_failures` failed reads
/// - [`ProbeError::Interrupted`] on cancellation or pass deadline
pub async fn await_convergence<P>(
    client: &dyn BackendServiceClient,
    name: &str,
    predicate: P,
    timeout: Duration,
    config: &ProbeConfig,
    ctx: &PassContext,
) -> Result<Option<ObservedState>, ProbeError>
where
    P: Fn(Option<&ObservedState>) -> bool,
{
    let start = Instant::now();
    let mut interval = config.initial_interval;
    let mut failures = 0u32;
    let mut last_observed: Option<ObservedState> = None;
    let mut reads = 0u32;

    loop {
        reads = reads.saturating_add(1);
        let budget = timeout
            .saturating_sub(start.elapsed())
            .saturating_add(interval);
        let read = tokio::time::timeout(budget, ctx.call(client.get(name)))
            .await
            .unwrap_or_else(|_| Err(CallError::Api(ApiError::timeout(budget))));
        match read {
            Ok(observed) => {
                failures = 0;
                if predicate(Some(&observed)) {
                    debug!(name = %name, reads, "Probe satisfied");
                    return Ok(Some(observed));
                }
                last_observed = Some(observed);
            }
            Err(CallError::Api(e)) if e.is_not_found() => {
                failures = 0;
                if predicate(None) {
                    debug!(name = %name, reads, "Probe satisfied by absence");
                    return Ok(None);
                }
            }
            Err(CallError::Api(e)) => {
                failures = failures.saturating_add(1);
                debug!(name = %name, failures, error = %e, "Probe read failed");
                if failures >= config.max_consecutive_failures.max(1) {
                    return Err(ProbeError::Unavailable {
                        name: name.to_string(),
                        failures,
                        last_error: e,
                        last_observed: last_observed.map(Box::new),
                    });
                }
            }
            Err(CallError::Interrupted(interrupt)) => {
                return Err(ProbeError::Interrupted {
                    name: name.to_string(),
                    interrupt,
                    last_observed: last_observed.map(Box::new),
                });
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout {
                name: name.to_string(),
                elapsed,
                last_observed: last_observed.map(Box::new),
            });
        }

        let wait = interval.min(timeout.saturating_sub(elapsed));
        if let Err(interrupt) = ctx.sleep(wait).await {
            return Err(ProbeError::Interrupted {
                name: name.to_string(),
                interrupt,
                last_observed: last_observed.map(Box::new),
            });
        }
        interval = config.next_interval(interval);
    }
}
