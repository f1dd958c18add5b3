//! TransactionSubmitter: hands a server envelope to the signer and optionally waits for inclusion.

use std::sync::Arc;
use std::time::Duration;

use peerlend_types::{Address, TransactionEnvelope, TransactionReceipt, TxHash};
use thiserror::Error;
use tracing::{debug, warn};

use crate::signer::{SignerError, SignerProvider};

/// How long `submit` waits after broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationPolicy {
    /// Return as soon as the provider hands back a hash.
    HashOnly,
    /// Poll for a receipt; after `max_polls` misses the handle is returned without one.
    WaitForReceipt { poll_interval_ms: u64, max_polls: u32 },
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self::WaitForReceipt {
            poll_interval_ms: 1_000,
            max_polls: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionHandle {
    pub hash: TxHash,
    pub receipt: Option<TransactionReceipt>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("submission rejected by signer: {0}")]
    Rejected(String),
    #[error("submission failed: {0}")]
    Failed(String),
    #[error("transaction {0} reverted")]
    Reverted(TxHash),
}

impl From<SignerError> for SubmitError {
    fn from(err: SignerError) -> Self {
        match err {
            SignerError::Declined(reason) => Self::Rejected(reason),
            other => Self::Failed(other.to_string()),
        }
    }
}

/// Never retries: a failed attempt must be restarted from the top by the caller.
pub struct TransactionSubmitter<P> {
    provider: Arc<P>,
    policy: ConfirmationPolicy,
}

impl<P> Clone for TransactionSubmitter<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            policy: self.policy,
        }
    }
}

impl<P: SignerProvider> TransactionSubmitter<P> {
    pub fn new(provider: Arc<P>, policy: ConfirmationPolicy) -> Self {
        Self { provider, policy }
    }

    pub fn policy(&self) -> ConfirmationPolicy {
        self.policy
    }

    pub async fn submit(
        &self,
        envelope: TransactionEnvelope,
        from: Address,
    ) -> Result<TransactionHandle, SubmitError> {
        let hash = self.provider.sign_and_broadcast(&envelope, from).await?;
        debug!(tx_hash = %hash, from = %from, "transaction submitted");

        let receipt = match self.policy {
            ConfirmationPolicy::HashOnly => None,
            ConfirmationPolicy::WaitForReceipt {
                poll_interval_ms,
                max_polls,
            } => self.wait_for_receipt(hash, poll_interval_ms, max_polls).await,
        };
        if let Some(receipt) = receipt {
            if !receipt.success {
                return Err(SubmitError::Reverted(hash));
            }
        }
        Ok(TransactionHandle { hash, receipt })
    }

    async fn wait_for_receipt(
        &self,
        hash: TxHash,
        poll_interval_ms: u64,
        max_polls: u32,
    ) -> Option<TransactionReceipt> {
        for poll in 0..max_polls {
            match self.provider.transaction_receipt(hash).await {
                Ok(Some(receipt)) => return Some(receipt),
                Ok(None) => {}
                // The hash is already out; lookup failures only shorten what we know.
                Err(err) => warn!(tx_hash = %hash, poll, error = %err, "receipt lookup failed"),
            }
            tokio::time::sleep(Duration::from_millis(poll_interval_ms)).await;
        }
        debug!(tx_hash = %hash, max_polls, "no receipt yet, returning hash only");
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use alloy_primitives::{Bytes, U256};
    use peerlend_chain::scenarios::ALICE_KEY;
    use peerlend_chain::{DemoScenario, SharedMockChain};
    use peerlend_types::TransactionEnvelope;

    use super::{ConfirmationPolicy, SubmitError, TransactionSubmitter};
    use crate::signer::{LocalKeyWallet, SignerProvider};

    async fn setup(
        policy: ConfirmationPolicy,
    ) -> (
        DemoScenario,
        Arc<LocalKeyWallet<SharedMockChain>>,
        TransactionSubmitter<LocalKeyWallet<SharedMockChain>>,
    ) {
        let scenario = DemoScenario::new(1337).expect("scenario");
        let wallet =
            Arc::new(LocalKeyWallet::new(scenario.chain.clone(), [ALICE_KEY]).expect("keys"));
        wallet.connect().await.expect("connect");
        let submitter = TransactionSubmitter::new(Arc::clone(&wallet), policy);
        (scenario, wallet, submitter)
    }

    fn envelope(scenario: &DemoScenario) -> TransactionEnvelope {
        TransactionEnvelope {
            to: scenario.contract,
            value: U256::from(5u64),
            gas_limit: 300_000,
            max_fee_per_gas: 2_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            data: Bytes::from(vec![0x01]),
        }
    }

    #[tokio::test]
    async fn waits_for_receipt() {
        let policy = ConfirmationPolicy::WaitForReceipt {
            poll_interval_ms: 10,
            max_polls: 3,
        };
        let (scenario, _, submitter) = setup(policy).await;
        let handle = submitter
            .submit(envelope(&scenario), scenario.accounts.alice)
            .await
            .expect("submitted");
        let receipt = handle.receipt.expect("receipt");
        assert_eq!(receipt.tx_hash, handle.hash);
        assert!(receipt.success);
    }

    #[tokio::test(start_paused = true)]
    async fn unmined_transaction_returns_hash_only() {
        let policy = ConfirmationPolicy::WaitForReceipt {
            poll_interval_ms: 10,
            max_polls: 3,
        };
        let (scenario, _, submitter) = setup(policy).await;
        scenario
            .chain
            .with_chain(|c| c.set_auto_mine(false))
            .expect("lock");
        let handle = submitter
            .submit(envelope(&scenario), scenario.accounts.alice)
            .await
            .expect("submitted");
        assert!(handle.receipt.is_none());
    }

    #[tokio::test]
    async fn hash_only_policy_skips_receipt() {
        let (scenario, _, submitter) = setup(ConfirmationPolicy::HashOnly).await;
        let handle = submitter
            .submit(envelope(&scenario), scenario.accounts.alice)
            .await
            .expect("submitted");
        assert!(handle.receipt.is_none());
    }

    #[tokio::test]
    async fn decline_is_rejected_and_node_error_is_failed() {
        let (scenario, wallet, submitter) = setup(ConfirmationPolicy::HashOnly).await;
        wallet.set_decline_signing(true);
        assert!(matches!(
            submitter
                .submit(envelope(&scenario), scenario.accounts.alice)
                .await,
            Err(SubmitError::Rejected(_))
        ));

        wallet.set_decline_signing(false);
        scenario
            .chain
            .with_chain(|c| c.set_offline(true))
            .expect("lock");
        assert!(matches!(
            submitter
                .submit(envelope(&scenario), scenario.accounts.alice)
                .await,
            Err(SubmitError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn reverted_receipt_is_reported() {
        let policy = ConfirmationPolicy::WaitForReceipt {
            poll_interval_ms: 10,
            max_polls: 3,
        };
        let (scenario, _, submitter) = setup(policy).await;
        scenario
            .chain
            .with_chain(|c| c.revert_next_transaction())
            .expect("lock");
        assert!(matches!(
            submitter
                .submit(envelope(&scenario), scenario.accounts.alice)
                .await,
            Err(SubmitError::Reverted(_))
        ));
    }
}
