//! Error taxonomy for update fetches

use std::time::Duration;
use thiserror::Error;

/// Why a refresh cycle failed
///
/// Transient kinds ([`Failed`](UpdateError::Failed) and
/// [`Timeout`](UpdateError::Timeout)) mark the coordinator unavailable and
/// are retried on the next cycle. [`AuthFailed`](UpdateError::AuthFailed) is
/// never retried automatically: setup code catches it and requests a
/// re-authentication flow instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("update failed: {0}")]
    Failed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("update timed out after {0:?}")]
    Timeout(Duration),

    #[error("coordinator is stopped")]
    Stopped,
}

impl UpdateError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed(message.into())
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthFailed(_))
    }

    /// Recoverable by simply trying again later
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Timeout(_))
    }
}

pub type UpdateResult<T> = Result<T, UpdateError>;
