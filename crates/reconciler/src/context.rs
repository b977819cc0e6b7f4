//! Per-pass cancellation and deadlines.
//!
//! Remote calls and sleeps are the only suspension points of a pass; both go
//! through [`PassContext`] so that cancellation and the pass deadline are
//! observed everywhere.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::ApiError;

/// Default upper bound for a single remote call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Stand-in deadline for timeouts too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Why a pass stopped before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interrupt {
    /// The caller cancelled the pass.
    Cancelled,
    /// The pass ran past its deadline.
    DeadlineExceeded,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled by caller"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Failure of a guarded remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The remote API reported a failure.
    Api(ApiError),
    /// The pass was interrupted while waiting.
    Interrupted(Interrupt),
}

impl From<ApiError> for CallError {
    fn from(e: ApiError) -> Self {
        Self::Api(e)
    }
}

impl From<Interrupt> for CallError {
    fn from(i: Interrupt) -> Self {
        Self::Interrupted(i)
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api(e) => write!(f, "{e}"),
            Self::Interrupted(i) => write!(f, "{i}"),
        }
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

/// Cancellation signal and deadline for one reconciliation pass.
#[derive(Debug, Clone)]
pub struct PassContext {
    cancel: CancellationToken,
    deadline: Instant,
    call_timeout: Duration,
}

impl PassContext {
    /// Create a context that expires `timeout` from now.
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: deadline_after(timeout),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// A context with its own token that is never cancelled by anyone else.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(timeout, CancellationToken::new())
    }

    /// Set the per-call timeout.
    #[must_use]
    pub const fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// The cancellation token.
    pub const fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Fail if the pass was cancelled or is past its deadline.
    ///
    /// # Errors
    ///
    /// Returns the [`Interrupt`] that stopped the pass.
    pub fn check(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            Err(Interrupt::Cancelled)
        } else if Instant::now() >= self.deadline {
            Err(Interrupt::DeadlineExceeded)
        } else {
            Ok(())
        }
    }

    /// Run a remote call under cancellation, the pass deadline, and the
    /// per-call timeout. A call outliving its timeout is a transient error.
    ///
    /// # Errors
    ///
    /// Returns the call's own error, a transient timeout, or the interrupt.
    pub async fn call<T, F>(&self, fut: F) -> Result<T, CallError>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(CallError::Interrupted(Interrupt::Cancelled)),
            () = tokio::time::sleep_until(self.deadline) => {
                Err(CallError::Interrupted(Interrupt::DeadlineExceeded))
            }
            outcome = tokio::time::timeout(self.call_timeout, fut) => match outcome {
                Ok(result) => result.map_err(CallError::Api),
                Err(_) => Err(CallError::Api(ApiError::timeout(self.call_timeout))),
            },
        }
    }

    /// Sleep, waking early on cancellation or the deadline.
    ///
    /// # Errors
    ///
    /// Returns the [`Interrupt`] that cut the sleep short.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupt> {
        self.check()?;
        let wake = Instant::now().checked_add(duration).unwrap_or(self.deadline);
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            () = tokio::time::sleep_until(wake.min(self.deadline)) => {
                if wake > self.deadline {
                    Err(Interrupt::DeadlineExceeded)
                } else {
                    Ok(())
                }
            }
        }
    }
}
