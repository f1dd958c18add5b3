pub mod calldata;
pub mod error;
pub mod ids;
pub mod lifecycle;
pub mod loan;
pub mod wire;

pub use error::{LifecycleError, ValidationError};
pub use ids::{Address, ChainId, LoanId, TxHash, UserId};
pub use loan::{
    ActionKind, Loan, LoanAction, LoanEvent, LoanEventKind, LoanState, Renegotiation, Role,
    TransactionEnvelope, TransactionReceipt, WalletBinding,
};
