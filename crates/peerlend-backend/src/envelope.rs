use peerlend_types::calldata::{call_value, encode_call};
use peerlend_types::{Address, Loan, LoanAction, TransactionEnvelope, ValidationError};

/// Gas parameters copied into every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasSettings {
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

impl Default for GasSettings {
    fn default() -> Self {
        Self {
            gas_limit: 300_000,
            max_fee_per_gas: 2_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
        }
    }
}

/// Builds settlement-contract calls. The same inputs always give the same envelope,
/// which commit verification relies on.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    contract: Address,
    gas: GasSettings,
}

impl EnvelopeBuilder {
    pub fn new(contract: Address, gas: GasSettings) -> Self {
        Self { contract, gas }
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    pub fn build(
        &self,
        loan: &Loan,
        action: &LoanAction,
        borrower_address: Address,
    ) -> Result<TransactionEnvelope, ValidationError> {
        Ok(TransactionEnvelope {
            to: self.contract,
            value: call_value(loan, action),
            gas_limit: self.gas.gas_limit,
            max_fee_per_gas: self.gas.max_fee_per_gas,
            max_priority_fee_per_gas: self.gas.max_priority_fee_per_gas,
            data: encode_call(loan, action, borrower_address)?,
        })
    }
}
