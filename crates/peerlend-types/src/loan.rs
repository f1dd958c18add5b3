//! Loan records, lifecycle actions, wallet bindings, and settlement envelopes.

use std::fmt;

use alloy_primitives::{Bytes, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::ids::{Address, LoanId, TxHash, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanState {
    Requested,
    Approved,
    Rejected,
    Repaid,
    RenegotiationRequested,
}

impl LoanState {
    pub const ALL: [LoanState; 5] = [
        LoanState::Requested,
        LoanState::Approved,
        LoanState::Rejected,
        LoanState::Repaid,
        LoanState::RenegotiationRequested,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Repaid)
    }
}

impl fmt::Display for LoanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Repaid => "repaid",
            Self::RenegotiationRequested => "renegotiation_requested",
        };
        f.write_str(s)
    }
}

/// Which side of a loan a user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Lender,
    Borrower,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lender => f.write_str("lender"),
            Self::Borrower => f.write_str("borrower"),
        }
    }
}

/// Outstanding due-date change proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Renegotiation {
    pub proposed_due_date: DateTime<Utc>,
    pub proposed_by: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    pub lender_id: UserId,
    pub borrower_id: UserId,
    pub amount: U256,
    pub collateral: String,
    pub due_date: DateTime<Utc>,
    pub state: LoanState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renegotiation: Option<Renegotiation>,
    pub created_at: DateTime<Utc>,
}

impl Loan {
    pub fn role_of(&self, user: &UserId) -> Option<Role> {
        if user == &self.lender_id {
            Some(Role::Lender)
        } else if user == &self.borrower_id {
            Some(Role::Borrower)
        } else {
            None
        }
    }

    pub fn participant(&self, role: Role) -> &UserId {
        match role {
            Role::Lender => &self.lender_id,
            Role::Borrower => &self.borrower_id,
        }
    }

    pub fn counterparty_of(&self, user: &UserId) -> Option<&UserId> {
        match self.role_of(user)? {
            Role::Lender => Some(&self.borrower_id),
            Role::Borrower => Some(&self.lender_id),
        }
    }

    pub fn check_invariants(&self) -> Result<(), ValidationError> {
        if self.lender_id == self.borrower_id {
            return Err(ValidationError::Message(
                "lender and borrower must be different users".to_string(),
            ));
        }
        if self.amount.is_zero() {
            return Err(ValidationError::InvalidField("amount"));
        }
        let outstanding = self.renegotiation.is_some();
        let expects_outstanding = self.state == LoanState::RenegotiationRequested;
        if outstanding != expects_outstanding {
            return Err(ValidationError::Message(format!(
                "renegotiation presence ({outstanding}) does not match state {}",
                self.state
            )));
        }
        Ok(())
    }
}

/// A requested lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoanAction {
    Approve,
    Reject,
    Repay,
    RequestRenegotiation { new_due_date: DateTime<Utc> },
    ApproveRenegotiation,
}

impl LoanAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Approve => ActionKind::Approve,
            Self::Reject => ActionKind::Reject,
            Self::Repay => ActionKind::Repay,
            Self::RequestRenegotiation { .. } => ActionKind::RequestRenegotiation,
            Self::ApproveRenegotiation => ActionKind::ApproveRenegotiation,
        }
    }

    pub fn required_role(&self) -> Role {
        self.kind().required_role()
    }
}

impl fmt::Display for LoanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind(), f)
    }
}

/// Data-free discriminant of [`LoanAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Approve,
    Reject,
    Repay,
    RequestRenegotiation,
    ApproveRenegotiation,
}

impl ActionKind {
    pub fn required_role(self) -> Role {
        match self {
            Self::Approve | Self::Reject | Self::ApproveRenegotiation => Role::Lender,
            Self::Repay | Self::RequestRenegotiation => Role::Borrower,
        }
    }

    /// Event delivered to the counterparty once this transition commits.
    pub fn event_kind(self) -> LoanEventKind {
        match self {
            Self::Approve => LoanEventKind::LoanApproved,
            Self::Reject => LoanEventKind::LoanRejected,
            Self::Repay => LoanEventKind::LoanRepaid,
            Self::RequestRenegotiation => LoanEventKind::RenegotiationRequested,
            Self::ApproveRenegotiation => LoanEventKind::RenegotiationApproved,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Repay => "repay",
            Self::RequestRenegotiation => "request_renegotiation",
            Self::ApproveRenegotiation => "approve_renegotiation",
        };
        f.write_str(s)
    }
}

/// Association between a user and the address they sign with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBinding {
    pub user_id: UserId,
    pub address: Address,
    pub bound_at: DateTime<Utc>,
}

/// Server-produced transaction fields. Consumed once by the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEnvelope {
    pub to: Address,
    pub value: U256,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanEventKind {
    LoanRequested,
    LoanApproved,
    LoanRejected,
    LoanRepaid,
    RenegotiationRequested,
    RenegotiationApproved,
    LoanDue,
}

impl LoanEventKind {
    pub fn title(self) -> &'static str {
        match self {
            Self::LoanRequested => "Loan Request",
            Self::LoanApproved => "Loan Approved",
            Self::LoanRejected => "Loan Rejected",
            Self::LoanRepaid => "Loan Repaid",
            Self::RenegotiationRequested => "Renegotiation Request",
            Self::RenegotiationApproved => "Renegotiation Approved",
            Self::LoanDue => "Loan Due",
        }
    }

    pub fn body(self) -> &'static str {
        match self {
            Self::LoanRequested => "You have a new loan request from a friend",
            Self::LoanApproved => "Your loan request has been approved by the lender",
            Self::LoanRejected => "Your loan request has been rejected by the lender",
            Self::LoanRepaid => "Your loan has been repaid by the borrower",
            Self::RenegotiationRequested => {
                "You have a new renegotiation request from the borrower"
            }
            Self::RenegotiationApproved => {
                "Your renegotiation request has been approved by the lender"
            }
            Self::LoanDue => "Don't forget to repay your loan before its due date",
        }
    }
}

/// Lifecycle notice addressed to one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanEvent {
    pub kind: LoanEventKind,
    pub loan_id: LoanId,
    pub to_user_id: UserId,
}
