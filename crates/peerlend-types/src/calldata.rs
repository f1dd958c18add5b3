//! Settlement contract call encoding.

use alloy_primitives::{Bytes, U256};
use alloy_sol_types::{sol, SolCall};

use crate::error::ValidationError;
use crate::ids::Address;
use crate::loan::{Loan, LoanAction};

sol! {
    function approveLoan(uint256 loanId, address borrower);
    function rejectLoan(uint256 loanId);
    function repayLoan(uint256 loanId);
    function requestRenegotiation(uint256 loanId, uint256 newDueDate);
    function approveRenegotiation(uint256 loanId);
}

/// Calldata for performing `action` on `loan`; `borrower` is the borrower's bound address.
pub fn encode_call(
    loan: &Loan,
    action: &LoanAction,
    borrower: Address,
) -> Result<Bytes, ValidationError> {
    let loan_id = U256::from(loan.id.0);
    let data = match action {
        LoanAction::Approve => approveLoanCall {
            loanId: loan_id,
            borrower: borrower.into(),
        }
        .abi_encode(),
        LoanAction::Reject => rejectLoanCall { loanId: loan_id }.abi_encode(),
        LoanAction::Repay => repayLoanCall { loanId: loan_id }.abi_encode(),
        LoanAction::RequestRenegotiation { new_due_date } => {
            let due = U256::try_from(new_due_date.timestamp())
                .map_err(|_| ValidationError::InvalidField("new_due_date"))?;
            requestRenegotiationCall {
                loanId: loan_id,
                newDueDate: due,
            }
            .abi_encode()
        }
        LoanAction::ApproveRenegotiation => {
            approveRenegotiationCall { loanId: loan_id }.abi_encode()
        }
    };
    Ok(Bytes::from(data))
}

/// Native value attached to the call: the principal moves on approve and repay.
pub fn call_value(loan: &Loan, action: &LoanAction) -> U256 {
    match action {
        LoanAction::Approve | LoanAction::Repay => loan.amount,
        _ => U256::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{keccak256, U256};
    use alloy_sol_types::SolCall;
    use chrono::{TimeZone, Utc};

    use super::{
        approveLoanCall, call_value, encode_call, rejectLoanCall, requestRenegotiationCall,
    };
    use crate::error::ValidationError;
    use crate::ids::{Address, LoanId, UserId};
    use crate::loan::{Loan, LoanAction, LoanState};

    fn loan() -> Loan {
        Loan {
            id: LoanId(0x2a),
            lender_id: UserId::new("bob").unwrap(),
            borrower_id: UserId::new("alice").unwrap(),
            amount: U256::from(1_000u64),
            collateral: String::new(),
            due_date: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            state: LoanState::Requested,
            renegotiation: None,
            created_at: Utc.with_ymd_and_hms(2029, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn selectors_hash_the_contract_signatures() {
        assert_eq!(
            rejectLoanCall::SELECTOR,
            keccak256("rejectLoan(uint256)")[..4]
        );
        assert_eq!(
            approveLoanCall::SELECTOR,
            keccak256("approveLoan(uint256,address)")[..4]
        );
    }

    #[test]
    fn approve_encodes_loan_id_and_borrower() {
        let borrower = Address::new([0x11; 20]);
        let data = encode_call(&loan(), &LoanAction::Approve, borrower).unwrap();
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(data[4 + 31], 0x2a);
        assert!(data[36..48].iter().all(|b| *b == 0));
        assert_eq!(&data[48..68], borrower.as_bytes());

        let call = approveLoanCall::abi_decode(&data).unwrap();
        assert_eq!(call.loanId, U256::from(0x2au64));
        assert_eq!(Address::from(call.borrower), borrower);
    }

    #[test]
    fn reject_has_single_word_and_no_value() {
        let data = encode_call(&loan(), &LoanAction::Reject, Address::default()).unwrap();
        assert_eq!(data.len(), 4 + 32);
        assert_eq!(data[..4], rejectLoanCall::SELECTOR);
        assert_eq!(call_value(&loan(), &LoanAction::Reject), U256::ZERO);
        assert_eq!(call_value(&loan(), &LoanAction::Repay), U256::from(1_000u64));
    }

    #[test]
    fn renegotiation_encodes_unix_seconds() {
        let date = Utc.with_ymd_and_hms(2030, 2, 1, 0, 0, 0).unwrap();
        let data = encode_call(
            &loan(),
            &LoanAction::RequestRenegotiation { new_due_date: date },
            Address::default(),
        )
        .unwrap();
        let call = requestRenegotiationCall::abi_decode(&data).unwrap();
        assert_eq!(call.newDueDate, U256::from(date.timestamp() as u64));
    }

    #[test]
    fn pre_epoch_renegotiation_date_is_refused() {
        let date = Utc.with_ymd_and_hms(1969, 12, 31, 0, 0, 0).unwrap();
        assert_eq!(
            encode_call(
                &loan(),
                &LoanAction::RequestRenegotiation { new_due_date: date },
                Address::default(),
            ),
            Err(ValidationError::InvalidField("new_due_date"))
        );
    }
}
