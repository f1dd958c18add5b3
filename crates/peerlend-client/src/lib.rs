//! Loan lifecycle coordination core.
//!
//! This crate exposes:
//! - collaborator traits (`LoanServer`, `NotificationRelay`, `SignerProvider`) and an HTTP
//!   implementation of the server side (`HttpTransport`),
//! - signer resolution against the user's wallet binding (`WalletSession`),
//! - envelope submission with optional receipt wait (`TransactionSubmitter`),
//! - the transition orchestrator with its per-loan guard (`LoanCoordinator`).

pub mod coordinator;
pub mod server;
pub mod signer;
pub mod submitter;
pub mod wallet;

pub use coordinator::{
    CoordinatorError, InFlightLoans, LoanCoordinator, LoanGuard, Session, TransitionOutcome,
};
pub use server::{
    retry_with_backoff, HttpTransport, LoanServer, NotificationRelay, RequestMeta, RetryPolicy,
    ServerError, TransportConfig,
};
pub use signer::{LocalKeyWallet, SignerError, SignerProvider};
pub use submitter::{ConfirmationPolicy, SubmitError, TransactionHandle, TransactionSubmitter};
pub use wallet::{WalletError, WalletSession};
