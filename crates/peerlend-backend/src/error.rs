use peerlend_chain::ChainError;
use peerlend_types::wire::ErrorCode;
use peerlend_types::{LifecycleError, ValidationError};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("transaction not confirmed: {0}")]
    NotConfirmed(String),
    #[error("settlement verification failed: {0}")]
    VerificationFailed(String),
    #[error("chain unavailable: {0}")]
    Chain(#[from] ChainError),
}

impl From<ValidationError> for ServiceError {
    fn from(err: ValidationError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl ServiceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadRequest(_) => ErrorCode::BadRequest,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::Lifecycle(LifecycleError::InvalidRenegotiationDate { .. }) => {
                ErrorCode::InvalidRenegotiationDate
            }
            Self::Lifecycle(
                LifecycleError::NotParticipant { .. } | LifecycleError::WrongRole { .. },
            ) => ErrorCode::Forbidden,
            Self::Lifecycle(LifecycleError::InvalidTransition { .. }) => {
                ErrorCode::InvalidTransition
            }
            Self::NotConfirmed(_) => ErrorCode::NotConfirmed,
            Self::VerificationFailed(_) => ErrorCode::VerificationFailed,
            Self::Chain(_) => ErrorCode::Unavailable,
        }
    }
}
