//! External signing provider capability and a local-key implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use peerlend_chain::{sign_envelope, signer_from_key, ChainAccess, ChainError, SigningError};
use peerlend_types::{Address, TransactionEnvelope, TransactionReceipt, TxHash};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("declined by user: {0}")]
    Declined(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("account {0} is not available in this wallet")]
    UnknownAccount(Address),
    #[error("signing failed: {0}")]
    Signing(String),
}

impl From<ChainError> for SignerError {
    fn from(err: ChainError) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<SigningError> for SignerError {
    fn from(err: SigningError) -> Self {
        Self::Signing(err.to_string())
    }
}

/// Wallet capability: connect, report the connected account, sign and broadcast.
#[async_trait]
pub trait SignerProvider: Send + Sync {
    /// May prompt the user; no timeout is applied here.
    async fn connect(&self) -> Result<Address, SignerError>;

    async fn current_address(&self) -> Option<Address>;

    async fn sign_and_broadcast(
        &self,
        envelope: &TransactionEnvelope,
        from: Address,
    ) -> Result<TxHash, SignerError>;

    async fn transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<TransactionReceipt>, SignerError>;
}

/// Signer provider holding private keys in memory and broadcasting through any [`ChainAccess`].
///
/// `connect` selects the active account (the first key unless changed with
/// [`LocalKeyWallet::select_account`]). Declines can be scripted to stand in for a
/// user cancelling the prompt.
///
/// Broadcasts from one account are serialized from the nonce read until the node
/// answers, so concurrent settlements never sign with the same nonce.
pub struct LocalKeyWallet<C> {
    chain: C,
    keys: HashMap<Address, PrivateKeySigner>,
    selected: Mutex<Option<Address>>,
    connected: Mutex<Option<Address>>,
    nonce_slots: Mutex<HashMap<Address, Arc<AsyncMutex<()>>>>,
    decline_connect: AtomicBool,
    decline_signing: AtomicBool,
}

impl<C: ChainAccess> LocalKeyWallet<C> {
    pub fn new(
        chain: C,
        private_keys: impl IntoIterator<Item = [u8; 32]>,
    ) -> Result<Self, SigningError> {
        let mut keys = HashMap::new();
        let mut first = None;
        for key in private_keys {
            let signer = signer_from_key(key)?;
            let address = Address::from(signer.address());
            first.get_or_insert(address);
            keys.insert(address, signer);
        }
        Ok(Self {
            chain,
            keys,
            selected: Mutex::new(first),
            connected: Mutex::new(None),
            nonce_slots: Mutex::new(HashMap::new()),
            decline_connect: AtomicBool::new(false),
            decline_signing: AtomicBool::new(false),
        })
    }

    /// Switches the active account, as a user would inside their wallet.
    pub fn select_account(&self, address: Address) -> Result<(), SignerError> {
        if !self.keys.contains_key(&address) {
            return Err(SignerError::UnknownAccount(address));
        }
        *lock(&self.selected) = Some(address);
        let mut connected = lock(&self.connected);
        if connected.is_some() {
            *connected = Some(address);
        }
        Ok(())
    }

    pub fn disconnect(&self) {
        *lock(&self.connected) = None;
    }

    pub fn set_decline_connect(&self, decline: bool) {
        self.decline_connect.store(decline, Ordering::SeqCst);
    }

    pub fn set_decline_signing(&self, decline: bool) {
        self.decline_signing.store(decline, Ordering::SeqCst);
    }

    /// Held from reading `from`'s pending nonce until its transaction is broadcast.
    async fn reserve_nonce(&self, from: Address) -> OwnedMutexGuard<()> {
        let slot = Arc::clone(lock(&self.nonce_slots).entry(from).or_default());
        slot.lock_owned().await
    }
}

#[async_trait]
impl<C: ChainAccess> SignerProvider for LocalKeyWallet<C> {
    async fn connect(&self) -> Result<Address, SignerError> {
        if self.decline_connect.load(Ordering::SeqCst) {
            return Err(SignerError::Declined("connection request rejected".to_string()));
        }
        let selected = (*lock(&self.selected))
            .ok_or_else(|| SignerError::Declined("wallet has no accounts".to_string()))?;
        *lock(&self.connected) = Some(selected);
        debug!(address = %selected, "wallet connected");
        Ok(selected)
    }

    async fn current_address(&self) -> Option<Address> {
        *lock(&self.connected)
    }

    async fn sign_and_broadcast(
        &self,
        envelope: &TransactionEnvelope,
        from: Address,
    ) -> Result<TxHash, SignerError> {
        if *lock(&self.connected) != Some(from) {
            return Err(SignerError::UnknownAccount(from));
        }
        let signer = self
            .keys
            .get(&from)
            .ok_or(SignerError::UnknownAccount(from))?;
        if self.decline_signing.load(Ordering::SeqCst) {
            return Err(SignerError::Declined("transaction signature denied".to_string()));
        }

        let _reservation = self.reserve_nonce(from).await;
        let chain_id = self.chain.chain_id().await?;
        let nonce = self.chain.nonce(from).await?;
        let signed = sign_envelope(signer, envelope, chain_id, nonce)?;
        let hash = self.chain.send_raw_transaction(signed.raw).await?;
        debug!(tx_hash = %hash, from = %from, nonce, "broadcast settlement transaction");
        Ok(hash)
    }

    async fn transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<TransactionReceipt>, SignerError> {
        Ok(self.chain.receipt(hash).await?)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{Bytes, U256};
    use async_trait::async_trait;
    use peerlend_chain::scenarios::{ALICE_KEY, BOB_KEY};
    use peerlend_chain::{ChainAccess, ChainError, ChainTransaction, DemoScenario, SharedMockChain};
    use peerlend_types::{Address, ChainId, TransactionEnvelope, TransactionReceipt, TxHash};

    use super::{LocalKeyWallet, SignerError, SignerProvider};

    /// Suspends before every call, as a chain behind a network does.
    struct YieldingChain(SharedMockChain);

    #[async_trait]
    impl ChainAccess for YieldingChain {
        async fn chain_id(&self) -> Result<ChainId, ChainError> {
            tokio::task::yield_now().await;
            self.0.chain_id().await
        }

        async fn nonce(&self, address: Address) -> Result<u64, ChainError> {
            tokio::task::yield_now().await;
            self.0.nonce(address).await
        }

        async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash, ChainError> {
            tokio::task::yield_now().await;
            self.0.send_raw_transaction(raw).await
        }

        async fn transaction(&self, hash: TxHash) -> Result<Option<ChainTransaction>, ChainError> {
            tokio::task::yield_now().await;
            self.0.transaction(hash).await
        }

        async fn receipt(&self, hash: TxHash) -> Result<Option<TransactionReceipt>, ChainError> {
            tokio::task::yield_now().await;
            self.0.receipt(hash).await
        }
    }

    fn envelope(scenario: &DemoScenario) -> TransactionEnvelope {
        TransactionEnvelope {
            to: scenario.contract,
            value: U256::from(10u64),
            gas_limit: 300_000,
            max_fee_per_gas: 2_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            data: Bytes::from(vec![0xaa]),
        }
    }

    fn wallet(scenario: &DemoScenario) -> LocalKeyWallet<SharedMockChain> {
        LocalKeyWallet::new(scenario.chain.clone(), [ALICE_KEY, BOB_KEY]).expect("keys")
    }

    #[tokio::test]
    async fn connect_selects_first_account() {
        let scenario = DemoScenario::new(1337).expect("scenario");
        let wallet = wallet(&scenario);
        assert_eq!(wallet.current_address().await, None);
        assert_eq!(wallet.connect().await, Ok(scenario.accounts.alice));
        assert_eq!(wallet.current_address().await, Some(scenario.accounts.alice));

        wallet.select_account(scenario.accounts.bob).expect("known");
        assert_eq!(wallet.current_address().await, Some(scenario.accounts.bob));
    }

    #[tokio::test]
    async fn signs_and_broadcasts_from_connected_account() {
        let scenario = DemoScenario::new(1337).expect("scenario");
        let wallet = wallet(&scenario);
        wallet.connect().await.expect("connects");

        let hash = wallet
            .sign_and_broadcast(&envelope(&scenario), scenario.accounts.alice)
            .await
            .expect("broadcast");
        let receipt = wallet
            .transaction_receipt(hash)
            .await
            .expect("online")
            .expect("auto mined");
        assert!(receipt.success);

        let second = wallet
            .sign_and_broadcast(&envelope(&scenario), scenario.accounts.alice)
            .await
            .expect("nonce advanced");
        assert_ne!(hash, second);
    }

    #[tokio::test]
    async fn scripted_declines_and_unknown_accounts() {
        let scenario = DemoScenario::new(1337).expect("scenario");
        let wallet = wallet(&scenario);

        wallet.set_decline_connect(true);
        assert!(matches!(wallet.connect().await, Err(SignerError::Declined(_))));
        wallet.set_decline_connect(false);
        wallet.connect().await.expect("connects");

        assert_eq!(
            wallet
                .sign_and_broadcast(&envelope(&scenario), scenario.accounts.carol)
                .await,
            Err(SignerError::UnknownAccount(scenario.accounts.carol))
        );

        wallet.set_decline_signing(true);
        assert!(matches!(
            wallet
                .sign_and_broadcast(&envelope(&scenario), scenario.accounts.alice)
                .await,
            Err(SignerError::Declined(_))
        ));
    }

    #[tokio::test]
    async fn node_errors_surface_as_network() {
        let scenario = DemoScenario::new(1337).expect("scenario");
        let wallet = wallet(&scenario);
        wallet.connect().await.expect("connects");
        scenario
            .chain
            .with_chain(|c| c.set_offline(true))
            .expect("lock");
        assert!(matches!(
            wallet
                .sign_and_broadcast(&envelope(&scenario), scenario.accounts.alice)
                .await,
            Err(SignerError::Network(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_broadcasts_from_one_account_use_distinct_nonces() {
        let scenario = DemoScenario::new(1337).expect("scenario");
        let wallet =
            LocalKeyWallet::new(YieldingChain(scenario.chain.clone()), [ALICE_KEY]).expect("keys");
        wallet.connect().await.expect("connects");
        let alice = scenario.accounts.alice;

        let first = envelope(&scenario);
        let second = TransactionEnvelope {
            value: U256::from(11u64),
            ..envelope(&scenario)
        };
        let (a, b) = tokio::join!(
            wallet.sign_and_broadcast(&first, alice),
            wallet.sign_and_broadcast(&second, alice),
        );
        assert_ne!(a.expect("first broadcast"), b.expect("second broadcast"));
        assert_eq!(
            scenario.chain.with_chain(|c| c.next_nonce(alice)).expect("lock"),
            2
        );
    }
}
