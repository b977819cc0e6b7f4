//! Error types for the reconciler.
//!
//! Every variant raised after the remote resource was fetched carries the
//! last observed state, so callers can persist what they knew even when a
//! pass fails.

use std::fmt;
use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;

use crate::checks::CheckFailures;
use crate::client::ApiError;
use crate::context::{CallError, Interrupt};
use crate::diff::Attribute;
use crate::lifecycle::ResourceState;
use crate::probe::ProbeError;
use crate::resolver::UnresolvedReason;
use crate::types::{ObservedState, Reference};

/// Phase of a pass in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Validate,
    Lock,
    Resolve,
    Fetch,
    Insert,
    Update,
    Delete,
    Verify,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Validate => "validate",
            Self::Lock => "lock",
            Self::Resolve => "resolve",
            Self::Fetch => "fetch",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Verify => "verify",
        };
        f.write_str(text)
    }
}

type Last = Option<Box<ObservedState>>;

/// Reconciler error type.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("invalid desired state: {failures}")]
    InvalidDesiredState { failures: CheckFailures },

    #[error("unresolved reference {reference}: {reason}")]
    UnresolvedReference {
        reference: Reference,
        reason: UnresolvedReason,
    },

    #[error("{step} failed after retries: {reason}")]
    Transient {
        step: Step,
        reason: String,
        last_observed: Last,
    },

    #[error("{step} failed: {reason}")]
    Permanent {
        step: Step,
        reason: String,
        last_observed: Last,
    },

    #[error("'{name}' was modified concurrently")]
    ConcurrentModification { name: String, last_observed: Last },

    #[error("'{name}' requires replacement to change: {}", .attributes.iter().join(", "))]
    ReplacementRequired {
        name: String,
        attributes: Vec<Attribute>,
        last_observed: Last,
    },

    #[error("'{name}' still present {}ms after delete", .elapsed.as_millis())]
    DeleteTimeout {
        name: String,
        elapsed: Duration,
        last_observed: Last,
    },

    #[error("'{name}' did not converge during {step} within {}ms", .elapsed.as_millis())]
    ConvergenceTimeout {
        name: String,
        step: Step,
        elapsed: Duration,
        last_observed: Last,
    },

    #[error("'{name}' unreadable after {failures} consecutive failures: {last_error}")]
    ProbeUnavailable {
        name: String,
        failures: u32,
        last_error: ApiError,
        last_observed: Last,
    },

    #[error("{step} interrupted: {reason}")]
    Cancelled {
        step: Step,
        reason: Interrupt,
        last_observed: Last,
    },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: ResourceState,
        to: ResourceState,
    },

    #[error("no reconciler registered for kind '{kind}'")]
    UnknownKind { kind: String },
}

impl Error {
    /// Create a permanent error.
    pub fn permanent(step: Step, reason: impl Into<String>) -> Self {
        Self::Permanent {
            step,
            reason: reason.into(),
            last_observed: None,
        }
    }

    /// Create an unknown kind error.
    pub fn unknown_kind(kind: impl Into<String>) -> Self {
        Self::UnknownKind { kind: kind.into() }
    }

    /// Classify a failed remote call made during `step`.
    ///
    /// Transient API errors (after retries) stay transient; not-found and
    /// conflicts that reach this point are unexpected and become permanent.
    pub fn from_call(step: Step, error: CallError, last_observed: Option<&ObservedState>) -> Self {
        let last_observed = last_observed.cloned().map(Box::new);
        match error {
            CallError::Api(e) if e.is_transient() => Self::Transient {
                step,
                reason: e.to_string(),
                last_observed,
            },
            CallError::Api(e) => Self::Permanent {
                step,
                reason: e.to_string(),
                last_observed,
            },
            CallError::Interrupted(reason) => Self::Cancelled {
                step,
                reason,
                last_observed,
            },
        }
    }

    /// Map a probe failure during `step`, keeping the fresher observation.
    pub fn from_probe(step: Step, error: ProbeError, fallback: Option<&ObservedState>) -> Self {
        let pick = |last: Last| last.or_else(|| fallback.cloned().map(Box::new));
        match error {
            ProbeError::Timeout {
                name,
                elapsed,
                last_observed,
            } => {
                if step == Step::Delete {
                    Self::DeleteTimeout {
                        name,
                        elapsed,
                        last_observed: pick(last_observed),
                    }
                } else {
                    Self::ConvergenceTimeout {
                        name,
                        step,
                        elapsed,
                        last_observed: pick(last_observed),
                    }
                }
            }
            ProbeError::Unavailable {
                name,
                failures,
                last_error,
                last_observed,
            } => Self::ProbeUnavailable {
                name,
                failures,
                last_error,
                last_observed: pick(last_observed),
            },
            ProbeError::Interrupted {
                interrupt,
                last_observed,
                ..
            } => Self::Cancelled {
                step,
                reason: interrupt,
                last_observed: pick(last_observed),
            },
        }
    }

    /// The last known remote state, when the failure happened after a fetch.
    pub fn last_observed(&self) -> Option<&ObservedState> {
        match self {
            Self::Transient { last_observed, .. }
            | Self::Permanent { last_observed, .. }
            | Self::ConcurrentModification { last_observed, .. }
            | Self::ReplacementRequired { last_observed, .. }
            | Self::DeleteTimeout { last_observed, .. }
            | Self::ConvergenceTimeout { last_observed, .. }
            | Self::ProbeUnavailable { last_observed, .. }
            | Self::Cancelled { last_observed, .. } => last_observed.as_deref(),
            Self::InvalidDesiredState { .. }
            | Self::UnresolvedReference { .. }
            | Self::InvalidTransition { .. }
            | Self::UnknownKind { .. } => None,
        }
    }

    /// The step that failed, if the failure is tied to one.
    pub const fn step(&self) -> Option<Step> {
        match self {
            Self::InvalidDesiredState { .. } => Some(Step::Validate),
            Self::UnresolvedReference { .. } => Some(Step::Resolve),
            Self::Transient { step, .. }
            | Self::Permanent { step, .. }
            | Self::ConvergenceTimeout { step, .. }
            | Self::Cancelled { step, .. } => Some(*step),
            Self::ConcurrentModification { .. } => Some(Step::Update),
            Self::DeleteTimeout { .. } => Some(Step::Delete),
            Self::ProbeUnavailable { .. } => Some(Step::Verify),
            Self::ReplacementRequired { .. }
            | Self::InvalidTransition { .. }
            | Self::UnknownKind { .. } => None,
        }
    }

    /// Whether a later pass may succeed without changing the request.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::UnresolvedReference { reason, .. } => reason.is_retryable(),
            Self::Transient { .. }
            | Self::ConcurrentModification { .. }
            | Self::DeleteTimeout { .. }
            | Self::ConvergenceTimeout { .. }
            | Self::ProbeUnavailable { .. } => true,
            Self::InvalidDesiredState { .. }
            | Self::Permanent { .. }
            | Self::ReplacementRequired { .. }
            | Self::Cancelled { .. }
            | Self::InvalidTransition { .. }
            | Self::UnknownKind { .. } => false,
        }
    }
}

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;
