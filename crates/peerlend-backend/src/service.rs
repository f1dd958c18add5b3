//! Loan service: prepares settlement envelopes and commits transitions only after the
//! settling transaction is found on chain and matches what was prepared.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use peerlend_chain::ChainAccess;
use peerlend_types::wire::{NewLoanRequest, Notification, UserProfile};
use peerlend_types::{
    lifecycle, Address, Loan, LoanAction, LoanEvent, LoanId, Role, TransactionEnvelope, TxHash,
    UserId, WalletBinding,
};
use tracing::{info, warn};

use crate::envelope::EnvelopeBuilder;
use crate::error::ServiceError;
use crate::state::LoanStore;

#[derive(Clone)]
pub struct LoanService {
    store: Arc<LoanStore>,
    chain: Arc<dyn ChainAccess>,
    envelopes: EnvelopeBuilder,
}

impl LoanService {
    pub fn new(
        store: Arc<LoanStore>,
        chain: Arc<dyn ChainAccess>,
        envelopes: EnvelopeBuilder,
    ) -> Self {
        Self {
            store,
            chain,
            envelopes,
        }
    }

    pub fn store(&self) -> &Arc<LoanStore> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Users, friends, wallets
    // -----------------------------------------------------------------------

    pub fn register_user(&self, profile: UserProfile) -> Result<UserProfile, ServiceError> {
        let profile = self.store.register_user(profile)?;
        info!(user = %profile.user_id, "user registered");
        Ok(profile)
    }

    pub fn user(&self, user_id: &UserId) -> Result<UserProfile, ServiceError> {
        self.store.require_user(user_id)
    }

    pub fn add_friend(
        &self,
        user_id: &UserId,
        friend_id: &UserId,
    ) -> Result<Vec<UserProfile>, ServiceError> {
        self.store.add_friend(user_id, friend_id)?;
        info!(user = %user_id, friend = %friend_id, "friend added");
        Ok(self.store.friends(user_id))
    }

    pub fn friends(&self, user_id: &UserId) -> Result<Vec<UserProfile>, ServiceError> {
        self.store.require_user(user_id)?;
        Ok(self.store.friends(user_id))
    }

    pub fn bind_wallet(
        &self,
        user_id: &UserId,
        address: Address,
        now: DateTime<Utc>,
    ) -> Result<WalletBinding, ServiceError> {
        let binding = self.store.bind_wallet(user_id, address, now)?;
        info!(user = %user_id, address = %address, "wallet bound");
        Ok(binding)
    }

    pub fn binding(&self, user_id: &UserId) -> Result<WalletBinding, ServiceError> {
        self.store
            .binding(user_id)
            .ok_or_else(|| ServiceError::NotFound(format!("no wallet bound for {user_id}")))
    }

    // -----------------------------------------------------------------------
    // Loans
    // -----------------------------------------------------------------------

    pub fn create_loan(
        &self,
        borrower_id: &UserId,
        request: &NewLoanRequest,
        now: DateTime<Utc>,
    ) -> Result<Loan, ServiceError> {
        let loan = self.store.create_loan(borrower_id, request, now)?;
        info!(loan_id = %loan.id, user = %borrower_id, lender = %loan.lender_id, "loan requested");
        Ok(loan)
    }

    pub fn loans(&self, user_id: &UserId, role: Role) -> Vec<Loan> {
        self.store.loans_for(user_id, role)
    }

    /// Participants only.
    pub fn loan_for(&self, user_id: &UserId, loan_id: LoanId) -> Result<Loan, ServiceError> {
        let loan = self.store.loan(loan_id)?;
        if loan.role_of(user_id).is_none() {
            return Err(ServiceError::Forbidden(format!(
                "{user_id} is not a participant of loan {loan_id}"
            )));
        }
        Ok(loan)
    }

    pub fn prepare_transaction(
        &self,
        actor: &UserId,
        loan_id: LoanId,
        action: &LoanAction,
        now: DateTime<Utc>,
    ) -> Result<TransactionEnvelope, ServiceError> {
        let loan = self.store.loan(loan_id)?;
        lifecycle::validate(&loan, action, actor, now)?;
        self.require_binding(actor)?;
        let envelope = self
            .envelopes
            .build(&loan, action, self.borrower_address(&loan, action)?)?;
        info!(loan_id = %loan_id, action = %action, user = %actor, "envelope prepared");
        Ok(envelope)
    }

    pub async fn commit_transition(
        &self,
        actor: &UserId,
        loan_id: LoanId,
        action: &LoanAction,
        tx_hash: TxHash,
        now: DateTime<Utc>,
    ) -> Result<Loan, ServiceError> {
        let loan = self.store.loan(loan_id)?;
        match self.store.settlement(&tx_hash) {
            Some((settled_loan, kind)) if settled_loan == loan_id && kind == action.kind() => {
                if loan.role_of(actor).is_none() {
                    return Err(ServiceError::Forbidden(format!(
                        "{actor} is not a participant of loan {loan_id}"
                    )));
                }
                info!(loan_id = %loan_id, tx_hash = %tx_hash, "commit already applied");
                return Ok(loan);
            }
            Some(_) => {
                return Err(ServiceError::VerificationFailed(format!(
                    "transaction {tx_hash} already settled another transition"
                )));
            }
            None => {}
        }

        lifecycle::validate(&loan, action, actor, now)?;
        let binding = self.require_binding(actor)?;
        self.verify_settlement(&loan, action, &binding, tx_hash).await?;

        let next = lifecycle::apply(&loan, action, actor, now)?;
        let committed = self
            .store
            .commit_loan(&loan, next, tx_hash, action.kind())?;
        info!(
            loan_id = %loan_id,
            action = %action,
            tx_hash = %tx_hash,
            state = %committed.state,
            "transition committed"
        );
        Ok(committed)
    }

    /// Checks that `tx_hash` is mined, succeeded, and is exactly the envelope the
    /// server would prepare for this transition, sent from the actor's bound address.
    pub async fn verify_settlement(
        &self,
        loan: &Loan,
        action: &LoanAction,
        binding: &WalletBinding,
        tx_hash: TxHash,
    ) -> Result<(), ServiceError> {
        let tx = self
            .chain
            .transaction(tx_hash)
            .await?
            .ok_or_else(|| ServiceError::NotConfirmed(format!("transaction {tx_hash} not found")))?;
        let receipt = self
            .chain
            .receipt(tx_hash)
            .await?
            .ok_or_else(|| ServiceError::NotConfirmed(format!("transaction {tx_hash} not mined")))?;
        if !receipt.success {
            return Err(ServiceError::VerificationFailed(format!(
                "transaction {tx_hash} reverted in block {}",
                receipt.block_number
            )));
        }

        let expected = self
            .envelopes
            .build(loan, action, self.borrower_address(loan, action)?)?;
        let mismatch = if tx.from != binding.address {
            Some("sender is not the bound wallet")
        } else if tx.to != Some(expected.to) {
            Some("recipient is not the settlement contract")
        } else if tx.value != expected.value {
            Some("value does not match the loan")
        } else if tx.input != expected.data {
            Some("call data does not match the transition")
        } else {
            None
        };
        if let Some(reason) = mismatch {
            warn!(loan_id = %loan.id, tx_hash = %tx_hash, reason, "settlement mismatch");
            return Err(ServiceError::VerificationFailed(format!(
                "transaction {tx_hash}: {reason}"
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    /// Stores a notice from one participant to the other.
    pub fn deliver_notification(
        &self,
        sender: &UserId,
        event: &LoanEvent,
        now: DateTime<Utc>,
    ) -> Result<Notification, ServiceError> {
        let loan = self.store.loan(event.loan_id)?;
        if loan.counterparty_of(sender) != Some(&event.to_user_id) {
            return Err(ServiceError::Forbidden(format!(
                "{sender} cannot notify {} about loan {}",
                event.to_user_id, event.loan_id
            )));
        }
        Ok(self
            .store
            .push_notification(&event.to_user_id, event.loan_id, event.kind, now))
    }

    pub fn notifications(&self, user_id: &UserId) -> Vec<Notification> {
        self.store.notifications(user_id)
    }

    pub fn delete_notification(&self, user_id: &UserId, id: u64) -> Result<(), ServiceError> {
        self.store.delete_notification(user_id, id)
    }

    fn require_binding(&self, user_id: &UserId) -> Result<WalletBinding, ServiceError> {
        self.store.binding(user_id).ok_or_else(|| {
            ServiceError::BadRequest(format!("{user_id} has no wallet bound"))
        })
    }

    /// Only `Approve` encodes the borrower; other calls ignore the address.
    fn borrower_address(&self, loan: &Loan, action: &LoanAction) -> Result<Address, ServiceError> {
        match self.store.binding(&loan.borrower_id) {
            Some(binding) => Ok(binding.address),
            None if matches!(action, LoanAction::Approve) => {
                Err(ServiceError::BadRequest(format!(
                    "borrower {} has no wallet bound",
                    loan.borrower_id
                )))
            }
            None => Ok(Address::default()),
        }
    }
}
