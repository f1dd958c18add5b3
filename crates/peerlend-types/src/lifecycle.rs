//! Loan lifecycle state machine.
//!
//! ```text
//! Requested ──approve──▶ Approved ──repay──▶ Repaid
//!     │                   │    ▲
//!   reject     request_reneg.  approve_reneg.
//!     ▼                   ▼    │
//! Rejected          RenegotiationRequested
//! ```
//!
//! `Rejected` and `Repaid` are terminal. Every function here is pure: loans
//! are taken by reference and transitions produce new values.

use chrono::{DateTime, Utc};

use crate::error::LifecycleError;
use crate::ids::UserId;
use crate::loan::{ActionKind, Loan, LoanAction, LoanState, Renegotiation, Role};

/// Whether `action` is legal from the loan's current state.
pub fn can_transition(loan: &Loan, action: &LoanAction) -> bool {
    target_state(loan.state, action.kind()).is_some()
        && match action {
            LoanAction::RequestRenegotiation { .. } => loan.renegotiation.is_none(),
            LoanAction::ApproveRenegotiation => loan.renegotiation.is_some(),
            _ => true,
        }
}

/// State the loan moves to under `action`.
///
/// The renegotiation date is checked against the current due date before the
/// state, so an early date is reported as such from every state.
pub fn next_state(loan: &Loan, action: &LoanAction) -> Result<LoanState, LifecycleError> {
    if let LoanAction::RequestRenegotiation { new_due_date } = action {
        check_renegotiation_date(loan, *new_due_date, None)?;
    }
    if !can_transition(loan, action) {
        return Err(LifecycleError::InvalidTransition {
            from: loan.state,
            action: action.kind(),
        });
    }
    target_state(loan.state, action.kind()).ok_or(LifecycleError::InvalidTransition {
        from: loan.state,
        action: action.kind(),
    })
}

/// Full check for `actor` performing `action` at `now`.
pub fn validate(
    loan: &Loan,
    action: &LoanAction,
    actor: &UserId,
    now: DateTime<Utc>,
) -> Result<LoanState, LifecycleError> {
    let role = loan
        .role_of(actor)
        .ok_or_else(|| LifecycleError::NotParticipant {
            loan_id: loan.id,
            user: actor.clone(),
        })?;
    if let LoanAction::RequestRenegotiation { new_due_date } = action {
        check_renegotiation_date(loan, *new_due_date, Some(now))?;
    }
    let next = next_state(loan, action)?;
    let required = action.required_role();
    if role != required {
        return Err(LifecycleError::WrongRole {
            action: action.kind(),
            required,
        });
    }
    if let (LoanAction::ApproveRenegotiation, Some(pending)) = (action, &loan.renegotiation) {
        if &pending.proposed_by == actor {
            return Err(LifecycleError::WrongRole {
                action: ActionKind::ApproveRenegotiation,
                required: Role::Lender,
            });
        }
    }
    Ok(next)
}

/// Returns the loan as it looks after `actor` performs `action`.
pub fn apply(
    loan: &Loan,
    action: &LoanAction,
    actor: &UserId,
    now: DateTime<Utc>,
) -> Result<Loan, LifecycleError> {
    let state = validate(loan, action, actor, now)?;
    let mut next = loan.clone();
    next.state = state;
    match action {
        LoanAction::RequestRenegotiation { new_due_date } => {
            next.renegotiation = Some(Renegotiation {
                proposed_due_date: *new_due_date,
                proposed_by: actor.clone(),
            });
        }
        LoanAction::ApproveRenegotiation => {
            if let Some(pending) = next.renegotiation.take() {
                next.due_date = pending.proposed_due_date;
            }
        }
        LoanAction::Approve | LoanAction::Reject | LoanAction::Repay => {}
    }
    Ok(next)
}

fn target_state(from: LoanState, action: ActionKind) -> Option<LoanState> {
    use ActionKind as A;
    use LoanState as S;
    match (from, action) {
        (S::Requested, A::Approve) => Some(S::Approved),
        (S::Requested, A::Reject) => Some(S::Rejected),
        (S::Approved, A::Repay) => Some(S::Repaid),
        (S::Approved, A::RequestRenegotiation) => Some(S::RenegotiationRequested),
        (S::RenegotiationRequested, A::ApproveRenegotiation) => Some(S::Approved),
        _ => None,
    }
}

fn check_renegotiation_date(
    loan: &Loan,
    proposed: DateTime<Utc>,
    now: Option<DateTime<Utc>>,
) -> Result<(), LifecycleError> {
    let before_now = now.is_some_and(|now| proposed <= now);
    if proposed <= loan.due_date || before_now {
        return Err(LifecycleError::InvalidRenegotiationDate {
            proposed,
            current_due: loan.due_date,
        });
    }
    Ok(())
}
