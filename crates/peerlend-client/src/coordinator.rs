//! LoanCoordinator: drives one loan transition from local validation to committed record.
//!
//! ```text
//! validate -> guard(loan) -> ensure_signer [-> bind] -> prepare
//!          -> [spawned] submit -> commit -> [spawned] notify
//! ```
//!
//! Everything up to `prepare` can be abandoned by dropping the future. Once the
//! envelope is handed to the submitter the remainder runs in its own task that owns
//! the per-loan guard, so the loan stays locked until the attempt settles.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use peerlend_types::wire::{ErrorCode, NewLoanRequest};
use peerlend_types::{
    lifecycle, ActionKind, Address, LifecycleError, Loan, LoanAction, LoanEvent, LoanEventKind,
    LoanId, LoanState, TxHash, UserId, ValidationError, WalletBinding,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::server::{LoanServer, NotificationRelay, ServerError};
use crate::signer::{SignerError, SignerProvider};
use crate::submitter::{ConfirmationPolicy, SubmitError, TransactionHandle, TransactionSubmitter};
use crate::wallet::{WalletError, WalletSession};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("a transition on loan {0} is already in progress")]
    TransitionInProgress(LoanId),
    #[error("wallet is connected as {connected:?} but the user is bound to {bound}")]
    SignerMismatch {
        bound: Address,
        connected: Option<Address>,
    },
    #[error("wallet connection declined: {0}")]
    ConnectionDeclined(String),
    #[error("wallet provider error: {0}")]
    Wallet(SignerError),
    #[error("binding wallet address failed: {0}")]
    Binding(ServerError),
    #[error("preparing transaction failed: {0}")]
    Prepare(ServerError),
    #[error("submission rejected: {0}")]
    SubmissionRejected(String),
    #[error("submission failed: {0}")]
    SubmissionFailed(String),
    /// Funds moved on chain but the server record was not advanced. Recover with
    /// [`LoanCoordinator::retry_commit`] using `tx_hash`; never resubmit.
    #[error("transaction {tx_hash} for {action} on loan {loan_id} is not committed: {reason}")]
    PartialCommit {
        loan_id: LoanId,
        action: ActionKind,
        tx_hash: TxHash,
        reason: ServerError,
    },
    #[error("server refused to commit transaction {tx_hash}: {message}")]
    CommitRejected {
        tx_hash: TxHash,
        code: ErrorCode,
        message: String,
    },
    #[error("server request failed: {0}")]
    Server(ServerError),
    #[error("server returned an invalid loan: {0}")]
    InvalidLoan(String),
    #[error("transition task aborted: {0}")]
    Aborted(String),
}

impl CoordinatorError {
    /// True when the whole transition may be attempted again from scratch.
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            Self::TransitionInProgress(_)
                | Self::SignerMismatch { .. }
                | Self::ConnectionDeclined(_)
                | Self::Wallet(_)
                | Self::Binding(_)
                | Self::Prepare(_)
                | Self::SubmissionRejected(_)
                | Self::SubmissionFailed(_)
        )
    }
}

impl From<WalletError> for CoordinatorError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::SignerMismatch { bound, connected } => {
                Self::SignerMismatch { bound, connected }
            }
            WalletError::ConnectDeclined(reason) => Self::ConnectionDeclined(reason),
            WalletError::Provider(err) => Self::Wallet(err),
        }
    }
}

impl From<SubmitError> for CoordinatorError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Rejected(reason) => Self::SubmissionRejected(reason),
            SubmitError::Failed(reason) => Self::SubmissionFailed(reason),
            SubmitError::Reverted(hash) => {
                Self::SubmissionFailed(format!("transaction {hash} reverted"))
            }
        }
    }
}

impl From<ValidationError> for CoordinatorError {
    fn from(err: ValidationError) -> Self {
        Self::InvalidLoan(err.to_string())
    }
}

/// Caller identity plus its current wallet binding, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub binding: Option<WalletBinding>,
}

impl Session {
    pub fn new(user_id: UserId, binding: Option<WalletBinding>) -> Self {
        Self { user_id, binding }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub loan: Loan,
    pub tx: TransactionHandle,
    /// Set when this transition created the user's first binding.
    pub binding: Option<WalletBinding>,
}

/// Shared set of loans with a transition in flight.
#[derive(Debug, Clone, Default)]
pub struct InFlightLoans {
    ids: Arc<Mutex<HashSet<LoanId>>>,
}

impl InFlightLoans {
    pub fn try_acquire(&self, loan_id: LoanId) -> Result<LoanGuard, CoordinatorError> {
        if !lock(&self.ids).insert(loan_id) {
            return Err(CoordinatorError::TransitionInProgress(loan_id));
        }
        Ok(LoanGuard {
            ids: Arc::clone(&self.ids),
            loan_id,
        })
    }

    pub fn contains(&self, loan_id: LoanId) -> bool {
        lock(&self.ids).contains(&loan_id)
    }
}

/// Releases the loan when dropped.
#[derive(Debug)]
pub struct LoanGuard {
    ids: Arc<Mutex<HashSet<LoanId>>>,
    loan_id: LoanId,
}

impl Drop for LoanGuard {
    fn drop(&mut self) {
        lock(&self.ids).remove(&self.loan_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LoanCoordinator<S, P, R> {
    server: Arc<S>,
    wallet: WalletSession<P>,
    submitter: TransactionSubmitter<P>,
    relay: Arc<R>,
    in_flight: InFlightLoans,
}

impl<S, P, R> LoanCoordinator<S, P, R>
where
    S: LoanServer + 'static,
    P: SignerProvider + 'static,
    R: NotificationRelay + 'static,
{
    pub fn new(
        server: Arc<S>,
        provider: Arc<P>,
        relay: Arc<R>,
        confirmation: ConfirmationPolicy,
    ) -> Self {
        Self {
            server,
            wallet: WalletSession::new(Arc::clone(&provider)),
            submitter: TransactionSubmitter::new(provider, confirmation),
            relay,
            in_flight: InFlightLoans::default(),
        }
    }

    pub fn in_flight(&self) -> &InFlightLoans {
        &self.in_flight
    }

    /// Performs `action` on `loan` for the session user and returns the committed loan.
    pub async fn transition(
        &self,
        session: &Session,
        loan: &Loan,
        action: LoanAction,
    ) -> Result<TransitionOutcome, CoordinatorError> {
        let actor = session.user_id.clone();
        let expected = lifecycle::validate(loan, &action, &actor, Utc::now())?;
        let guard = self.in_flight.try_acquire(loan.id)?;

        let bound = session.binding.as_ref().map(|b| b.address);
        let signer = self.wallet.ensure_signer(bound).await?;
        let new_binding = match bound {
            Some(_) => None,
            None => Some(
                self.server
                    .bind_wallet_address(&actor, signer)
                    .await
                    .map_err(CoordinatorError::Binding)?,
            ),
        };

        let envelope = self
            .server
            .prepare_transaction(&actor, loan.id, &action)
            .await
            .map_err(CoordinatorError::Prepare)?;
        info!(
            loan_id = %loan.id,
            action = %action,
            user = %actor,
            to = %envelope.to,
            "prepared settlement"
        );

        let server = Arc::clone(&self.server);
        let relay = Arc::clone(&self.relay);
        let submitter = self.submitter.clone();
        let loan_id = loan.id;
        let counterparty = loan.counterparty_of(&actor).cloned();
        let task = tokio::spawn(async move {
            let _guard = guard;
            let tx = submitter.submit(envelope, signer).await?;
            info!(loan_id = %loan_id, action = %action, tx_hash = %tx.hash, "settlement submitted");

            let committed = commit(server.as_ref(), &actor, loan_id, &action, tx.hash).await?;
            check_returned(&committed, loan_id, expected)?;
            if let Some(to_user_id) = counterparty {
                spawn_notify(relay, actor, action.kind().event_kind(), loan_id, to_user_id);
            }
            Ok::<_, CoordinatorError>(TransitionOutcome {
                loan: committed,
                tx,
                binding: new_binding,
            })
        });
        task.await
            .map_err(|e| CoordinatorError::Aborted(e.to_string()))?
    }

    /// Re-sends a known hash to the server after a [`CoordinatorError::PartialCommit`].
    pub async fn retry_commit(
        &self,
        session: &Session,
        loan: &Loan,
        action: LoanAction,
        tx_hash: TxHash,
    ) -> Result<Loan, CoordinatorError> {
        let actor = &session.user_id;
        let expected = lifecycle::validate(loan, &action, actor, Utc::now())?;
        let _guard = self.in_flight.try_acquire(loan.id)?;

        let committed = commit(self.server.as_ref(), actor, loan.id, &action, tx_hash).await?;
        check_returned(&committed, loan.id, expected)?;
        info!(loan_id = %loan.id, action = %action, tx_hash = %tx_hash, "commit retried");
        if let Some(to_user_id) = loan.counterparty_of(actor) {
            spawn_notify(
                Arc::clone(&self.relay),
                actor.clone(),
                action.kind().event_kind(),
                loan.id,
                to_user_id.clone(),
            );
        }
        Ok(committed)
    }

    /// Creates a loan request from the session user to a friend and notifies the lender.
    pub async fn request_loan(
        &self,
        session: &Session,
        request: &NewLoanRequest,
    ) -> Result<Loan, CoordinatorError> {
        let loan = self
            .server
            .create_loan(&session.user_id, request)
            .await
            .map_err(CoordinatorError::Server)?;
        loan.check_invariants()?;
        if loan.state != LoanState::Requested || loan.borrower_id != session.user_id {
            return Err(CoordinatorError::InvalidLoan(format!(
                "new loan {} is {} for borrower {}",
                loan.id, loan.state, loan.borrower_id
            )));
        }
        info!(
            loan_id = %loan.id,
            user = %session.user_id,
            lender = %loan.lender_id,
            "loan requested"
        );
        spawn_notify(
            Arc::clone(&self.relay),
            session.user_id.clone(),
            LoanEventKind::LoanRequested,
            loan.id,
            loan.lender_id.clone(),
        );
        Ok(loan)
    }
}

async fn commit<S: LoanServer + ?Sized>(
    server: &S,
    actor: &UserId,
    loan_id: LoanId,
    action: &LoanAction,
    tx_hash: TxHash,
) -> Result<Loan, CoordinatorError> {
    match server.commit_transition(actor, loan_id, action, tx_hash).await {
        Ok(loan) => Ok(loan),
        Err(ServerError::Rejected { code, message }) => {
            warn!(loan_id = %loan_id, tx_hash = %tx_hash, ?code, "commit rejected");
            Err(CoordinatorError::CommitRejected {
                tx_hash,
                code,
                message,
            })
        }
        Err(reason) => {
            warn!(loan_id = %loan_id, tx_hash = %tx_hash, error = %reason, "commit not recorded");
            Err(CoordinatorError::PartialCommit {
                loan_id,
                action: action.kind(),
                tx_hash,
                reason,
            })
        }
    }
}

fn check_returned(
    loan: &Loan,
    loan_id: LoanId,
    expected: LoanState,
) -> Result<(), CoordinatorError> {
    loan.check_invariants()?;
    if loan.id != loan_id || loan.state != expected {
        return Err(CoordinatorError::InvalidLoan(format!(
            "expected loan {loan_id} in state {expected}, got loan {} in state {}",
            loan.id, loan.state
        )));
    }
    Ok(())
}

fn spawn_notify<R: NotificationRelay + 'static>(
    relay: Arc<R>,
    sender: UserId,
    kind: LoanEventKind,
    loan_id: LoanId,
    to_user_id: UserId,
) {
    let event = LoanEvent {
        kind,
        loan_id,
        to_user_id,
    };
    tokio::spawn(async move {
        if let Err(err) = relay.notify(&sender, event).await {
            warn!(loan_id = %loan_id, ?kind, error = %err, "notification not delivered");
        }
    });
}
