//! Config entry lifecycle transitions
//!
//! ```text
//! NotLoaded → SetupInProgress → Loaded
//!                             ↘ SetupError → SetupInProgress (manual retry)
//!                             ↘ SetupRetry → SetupInProgress (auto retry)
//!
//! Loaded/SetupError/SetupRetry → UnloadInProgress → NotLoaded
//!                                                 ↘ FailedUnload (terminal)
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::entry::ConfigEntryState;

/// Attempted an edge the lifecycle graph does not have
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid config entry transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: ConfigEntryState,
    pub to: ConfigEntryState,
}

impl ConfigEntryState {
    /// Validate and return the target state, or an error for an invalid edge
    pub fn try_transition(
        self,
        to: ConfigEntryState,
    ) -> Result<ConfigEntryState, InvalidTransition> {
        use ConfigEntryState::*;

        let valid = matches!(
            (self, to),
            (NotLoaded, SetupInProgress)
                | (SetupInProgress, Loaded | SetupError | SetupRetry)
                | (SetupError | SetupRetry, SetupInProgress | UnloadInProgress)
                | (Loaded, UnloadInProgress)
                | (UnloadInProgress, NotLoaded | FailedUnload)
        );

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    pub fn can_transition_to(self, to: ConfigEntryState) -> bool {
        self.try_transition(to).is_ok()
    }
}

/// Backoff before the next automatic setup retry
///
/// Doubles up to five attempts (5s, 10s, 20s, 40s, 80s, then flat), with up
/// to 100ms of jitter so many entries failing together do not retry in
/// lockstep.
pub fn retry_delay(tries: u32) -> Duration {
    let base = 2_u32.pow(tries.min(4)) * 5;
    let jitter = rand::random::<f64>() * 0.1;
    Duration::from_secs_f64(base as f64 + jitter)
}
