//! Lifecycle state machine of one remote resource.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Where a resource is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Absent,
    Creating,
    Present,
    Updating,
    Deleting,
    Failed,
}

impl ResourceState {
    /// Whether moving to `next` is a legal transition.
    ///
    /// `Failed` is reachable from every in-flight state and is terminal for
    /// the pass that reached it.
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ResourceState::{Absent, Creating, Deleting, Failed, Present, Updating};
        matches!(
            (self, next),
            (Absent, Creating)
                | (Creating, Present)
                | (Present, Updating | Deleting)
                | (Updating, Present)
                | (Deleting, Absent)
                | (Creating | Updating | Deleting, Failed)
        )
    }

    /// Whether a mutation is in flight.
    pub const fn is_transitional(self) -> bool {
        matches!(self, Self::Creating | Self::Updating | Self::Deleting)
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Absent => "absent",
            Self::Creating => "creating",
            Self::Present => "present",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// Tracks the state of one resource through a pass.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    name: String,
    state: ResourceState,
    history: Vec<ResourceState>,
}

impl Lifecycle {
    /// Start tracking `name` from `initial`.
    pub fn new(name: impl Into<String>, initial: ResourceState) -> Self {
        Self {
            name: name.into(),
            state: initial,
            history: vec![initial],
        }
    }

    /// Current state.
    pub const fn state(&self) -> ResourceState {
        self.state
    }

    /// Every state visited, oldest first.
    pub fn history(&self) -> &[ResourceState] {
        &self.history
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the move is illegal; the state
    /// is left unchanged.
    pub fn transition(&mut self, next: ResourceState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            warn!(name = %self.name, from = %self.state, to = %next, "Rejected transition");
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        info!(name = %self.name, from = %self.state, to = %next, "Lifecycle transition");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Mark the pass as failed, if a mutation was in flight.
    ///
    /// A failure before any mutation leaves the state as it was.
    pub fn fail(&mut self) {
        if self.state.is_transitional() {
            let _ = self.transition(ResourceState::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let mut lifecycle = Lifecycle::new("svc", ResourceState::Absent);
        for next in [
            ResourceState::Creating,
            ResourceState::Present,
            ResourceState::Updating,
            ResourceState::Present,
            ResourceState::Deleting,
            ResourceState::Absent,
        ] {
            lifecycle.transition(next).unwrap();
        }
        assert_eq!(lifecycle.state(), ResourceState::Absent);
        assert_eq!(lifecycle.history().len(), 7);
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let mut lifecycle = Lifecycle::new("svc", ResourceState::Absent);
        let err = lifecycle.transition(ResourceState::Deleting).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidTransition {
                from: ResourceState::Absent,
                to: ResourceState::Deleting,
            }
        );
        assert_eq!(lifecycle.state(), ResourceState::Absent);
    }

    #[test]
    fn test_fail_only_from_transitional_states() {
        let mut idle = Lifecycle::new("svc", ResourceState::Present);
        idle.fail();
        assert_eq!(idle.state(), ResourceState::Present);

        let mut busy = Lifecycle::new("svc", ResourceState::Present);
        busy.transition(ResourceState::Updating).unwrap();
        busy.fail();
        assert_eq!(busy.state(), ResourceState::Failed);
        assert!(!ResourceState::Failed.can_transition_to(ResourceState::Present));
    }
}
