//! Coordinator lifecycle state machine
//!
//! ```text
//! Uninitialized → Refreshing → Success
//!                            ↘ Failed
//! Success/Failed → Refreshing   (next timer tick or manual trigger)
//! any non-stopped → Stopped     (terminal, on unload)
//! ```

use thiserror::Error;

/// Attempted an edge the lifecycle graph does not have
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid coordinator transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: CoordinatorState,
    pub to: CoordinatorState,
}

/// Where a coordinator is in its refresh lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinatorState {
    /// Created, no refresh attempted yet
    #[default]
    Uninitialized,
    /// A fetch is in flight
    Refreshing,
    /// Last cycle produced fresh data
    Success,
    /// Last cycle failed; previous data (if any) is retained
    Failed,
    /// Shut down; no further refreshes will run
    Stopped,
}

impl CoordinatorState {
    /// Validate and return the target state, or an error for an invalid edge
    pub fn try_transition(self, to: CoordinatorState) -> Result<CoordinatorState, InvalidTransition> {
        use CoordinatorState::*;

        let valid = match (self, to) {
            (Uninitialized, Refreshing) => true,
            (Refreshing, Success | Failed) => true,
            (Success | Failed, Refreshing) => true,
            // shutdown is allowed from anywhere except itself
            (Stopped, _) => false,
            (_, Stopped) => true,
            _ => false,
        };

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    pub fn can_transition_to(self, to: CoordinatorState) -> bool {
        self.try_transition(to).is_ok()
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, CoordinatorState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CoordinatorState::*;

    #[test]
    fn refresh_loop_edges() {
        assert!(Uninitialized.can_transition_to(Refreshing));
        assert!(Refreshing.can_transition_to(Success));
        assert!(Refreshing.can_transition_to(Failed));
        assert!(Success.can_transition_to(Refreshing));
        assert!(Failed.can_transition_to(Refreshing));
    }

    #[test]
    fn no_shortcut_edges() {
        assert!(!Uninitialized.can_transition_to(Success));
        assert!(!Uninitialized.can_transition_to(Failed));
        assert!(!Success.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Success));
        assert!(!Refreshing.can_transition_to(Uninitialized));
    }

    #[test]
    fn stopped_is_terminal() {
        for state in [Uninitialized, Refreshing, Success, Failed] {
            assert!(state.can_transition_to(Stopped));
        }
        for state in [Uninitialized, Refreshing, Success, Failed, Stopped] {
            assert!(!Stopped.can_transition_to(state));
        }
    }

    #[test]
    fn full_cycle_walk() {
        let state = Uninitialized;
        let state = state.try_transition(Refreshing).unwrap();
        let state = state.try_transition(Failed).unwrap();
        let state = state.try_transition(Refreshing).unwrap();
        let state = state.try_transition(Success).unwrap();
        let state = state.try_transition(Stopped).unwrap();
        assert!(state.is_stopped());
    }

    #[test]
    fn invalid_edge_reports_both_ends() {
        let err = Stopped.try_transition(Refreshing).unwrap_err();
        assert_eq!(err.from, Stopped);
        assert_eq!(err.to, Refreshing);
    }
}
