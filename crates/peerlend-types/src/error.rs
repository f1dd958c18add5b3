//! Error types for input validation and loan lifecycle transitions.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ids::{LoanId, UserId};
use crate::loan::{ActionKind, LoanState, Role};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid length for {kind}: expected {expected}, got {actual}")]
    InvalidLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid field `{0}`")]
    InvalidField(&'static str),
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("cannot {action} a loan in state {from}")]
    InvalidTransition { from: LoanState, action: ActionKind },
    #[error("user {user} is not a participant of loan {loan_id}")]
    NotParticipant { loan_id: LoanId, user: UserId },
    #[error("only the {required} may {action}")]
    WrongRole { action: ActionKind, required: Role },
    #[error(
        "proposed due date {proposed} must be later than the current due date {current_due} \
         and the present time"
    )]
    InvalidRenegotiationDate {
        proposed: DateTime<Utc>,
        current_due: DateTime<Utc>,
    },
}

impl LifecycleError {
    /// True for every failure in the "not legal from here" class, which is never retried.
    pub fn is_invalid_transition(&self) -> bool {
        !matches!(self, Self::InvalidRenegotiationDate { .. })
    }
}
