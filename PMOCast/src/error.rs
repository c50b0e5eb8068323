use pmocache::CacheError;
use pmomp3::CutError;
use pmothrottle::ThrottleError;

/// Errors returned by [`crate::Delivery`].
#[derive(thiserror::Error, Debug)]
pub enum DeliveryError {
    #[error("admission refused: {0}")]
    Admission(#[from] ThrottleError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Cut(#[from] CutError),
}

impl DeliveryError {
    /// True when the request may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Admission(err) => err.is_retryable(),
            DeliveryError::Cache(_) | DeliveryError::Cut(_) => false,
        }
    }
}
