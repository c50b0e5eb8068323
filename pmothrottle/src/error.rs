use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ThrottleError {
    #[error("unknown identity '{0}'")]
    Unknown(String),

    #[error("identity '{0}' is disabled")]
    Disabled(String),

    #[error("capacity exceeded for '{identity}' (waited {waited:?})")]
    CapacityExceeded { identity: String, waited: Duration },

    #[error("a resize of '{0}' is already running")]
    ResizeInProgress(String),

    #[error("admission for '{0}' was shut down")]
    Closed(String),
}

impl ThrottleError {
    /// True when the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ThrottleError::CapacityExceeded { .. })
    }
}
