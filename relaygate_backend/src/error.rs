use crate::notices::Notice;
use crate::transport::TransportError;
use thiserror::Error;

/// Failures surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store provider rejected the operation because its quota is spent.
    #[error("store quota exceeded")]
    QuotaExceeded,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_quota(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.into())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Error taxonomy for the relay core.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A required external identifier is missing. Fatal, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("store quota exceeded")]
    QuotaExceeded,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// Thread missing or redirected, session or challenge gone. Callers turn
    /// these into a recovery action before anything reaches the user.
    #[error("state consistency: {0}")]
    StateConsistency(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::QuotaExceeded => RelayError::QuotaExceeded,
            StoreError::Backend(err) => RelayError::Internal(err),
        }
    }
}

impl RelayError {
    /// The fixed user-facing message for this failure.
    pub fn notice(&self) -> Notice {
        match self {
            RelayError::Configuration(_) => Notice::Maintenance,
            RelayError::QuotaExceeded => Notice::QuotaExceeded,
            RelayError::Transport(_) | RelayError::Internal(_) => Notice::TryAgainLater,
            RelayError::StateConsistency(_) => Notice::TryAgainLater,
            RelayError::Validation(_) => Notice::InvalidRequest,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_store_error_maps_to_quota_notice() {
        let err: RelayError = StoreError::QuotaExceeded.into();
        assert!(matches!(err, RelayError::QuotaExceeded));
        assert_eq!(err.notice(), Notice::QuotaExceeded);
    }

    #[test]
    fn internal_detail_never_reaches_the_notice() {
        let err = RelayError::Internal(anyhow::anyhow!("sqlite disk I/O error at page 7"));
        assert!(!err.notice().text().contains("sqlite"));
    }
}
