//! MockChain: in-memory EVM-style ledger with a mempool, nonces, and native balances.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use alloy_primitives::{Bytes, U256};
use async_trait::async_trait;
use peerlend_types::{Address, ChainId, TransactionReceipt, TxHash};
use tracing::debug;

use crate::access::{ChainAccess, ChainError, ChainTransaction};
use crate::signing::decode_signed_tx;

#[derive(Debug, Clone)]
pub struct MockChain {
    chain_id: ChainId,
    pub balances: HashMap<Address, U256>,
    pub nonces: HashMap<Address, u64>,
    pub transactions: HashMap<TxHash, ChainTransaction>,
    pub receipts: HashMap<TxHash, TransactionReceipt>,
    mempool: Vec<TxHash>,
    pub block_number: u64,
    auto_mine: bool,
    offline: bool,
    revert_next: bool,
}

impl MockChain {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            balances: HashMap::new(),
            nonces: HashMap::new(),
            transactions: HashMap::new(),
            receipts: HashMap::new(),
            mempool: Vec::new(),
            block_number: 0,
            auto_mine: true,
            offline: false,
            revert_next: false,
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn fund(&mut self, address: Address, amount: U256) {
        let balance = self.balances.entry(address).or_default();
        *balance = balance.saturating_add(amount);
    }

    pub fn balance(&self, address: Address) -> U256 {
        self.balances.get(&address).copied().unwrap_or_default()
    }

    /// While offline every call fails with [`ChainError::Unavailable`].
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    /// When disabled, accepted transactions wait in the mempool until [`Self::mine_pending`].
    pub fn set_auto_mine(&mut self, auto_mine: bool) {
        self.auto_mine = auto_mine;
    }

    /// The next mined transaction gets a failed receipt and moves no value.
    pub fn revert_next_transaction(&mut self) {
        self.revert_next = true;
    }

    pub fn pending_count(&self) -> usize {
        self.mempool.len()
    }

    pub fn next_nonce(&self, address: Address) -> u64 {
        self.nonces.get(&address).copied().unwrap_or_default()
    }

    pub fn submit_raw(&mut self, raw: &[u8]) -> Result<TxHash, ChainError> {
        self.ensure_online()?;
        let decoded = decode_signed_tx(raw).map_err(ChainError::Rejected)?;
        if decoded.chain_id != self.chain_id {
            return Err(ChainError::Rejected(format!(
                "chain id mismatch: expected {}, got {}",
                self.chain_id, decoded.chain_id
            )));
        }
        if self.transactions.contains_key(&decoded.hash) {
            return Err(ChainError::Rejected("already known".to_string()));
        }
        let expected_nonce = self.next_nonce(decoded.from);
        if decoded.nonce != expected_nonce {
            return Err(ChainError::Rejected(format!(
                "nonce mismatch: expected {expected_nonce}, got {}",
                decoded.nonce
            )));
        }
        if self.balance(decoded.from) < decoded.value {
            return Err(ChainError::Rejected(
                "insufficient funds for transfer".to_string(),
            ));
        }

        self.nonces.insert(decoded.from, expected_nonce + 1);
        self.transactions.insert(
            decoded.hash,
            ChainTransaction {
                hash: decoded.hash,
                from: decoded.from,
                to: decoded.to,
                value: decoded.value,
                input: decoded.input,
                nonce: decoded.nonce,
                raw: Bytes::copy_from_slice(raw),
            },
        );
        self.mempool.push(decoded.hash);
        debug!(tx_hash = %decoded.hash, from = %decoded.from, "accepted transaction");

        if self.auto_mine {
            self.mine_pending();
        }
        Ok(decoded.hash)
    }

    /// Includes every pending transaction in a new block; returns how many were mined.
    pub fn mine_pending(&mut self) -> usize {
        if self.mempool.is_empty() {
            return 0;
        }
        self.block_number += 1;
        let pending = std::mem::take(&mut self.mempool);
        let mined = pending.len();
        for hash in pending {
            let Some(tx) = self.transactions.get(&hash).cloned() else {
                continue;
            };
            let success = if std::mem::take(&mut self.revert_next) {
                false
            } else {
                self.transfer(&tx)
            };
            self.receipts.insert(
                hash,
                TransactionReceipt {
                    tx_hash: hash,
                    block_number: self.block_number,
                    success,
                },
            );
        }
        debug!(block = self.block_number, mined, "mined block");
        mined
    }

    pub fn transaction(&self, hash: &TxHash) -> Result<Option<ChainTransaction>, ChainError> {
        self.ensure_online()?;
        Ok(self.transactions.get(hash).cloned())
    }

    pub fn receipt(&self, hash: &TxHash) -> Result<Option<TransactionReceipt>, ChainError> {
        self.ensure_online()?;
        Ok(self.receipts.get(hash).copied())
    }

    fn transfer(&mut self, tx: &ChainTransaction) -> bool {
        let Some(to) = tx.to else {
            return false;
        };
        let from_balance = self.balance(tx.from);
        if from_balance < tx.value {
            return false;
        }
        self.balances.insert(tx.from, from_balance - tx.value);
        self.fund(to, tx.value);
        true
    }

    fn ensure_online(&self) -> Result<(), ChainError> {
        if self.offline {
            return Err(ChainError::Unavailable("node offline".to_string()));
        }
        Ok(())
    }
}

/// Cloneable handle to a [`MockChain`] shared between wallets and the server.
#[derive(Debug, Clone)]
pub struct SharedMockChain {
    chain: Arc<Mutex<MockChain>>,
}

impl SharedMockChain {
    pub fn new(chain: MockChain) -> Self {
        Self {
            chain: Arc::new(Mutex::new(chain)),
        }
    }

    pub fn with_chain<R>(&self, f: impl FnOnce(&mut MockChain) -> R) -> Result<R, ChainError> {
        let mut lock = self
            .chain
            .lock()
            .map_err(|_| ChainError::Unavailable("mutex poisoned".to_string()))?;
        Ok(f(&mut lock))
    }
}

#[async_trait]
impl ChainAccess for SharedMockChain {
    async fn chain_id(&self) -> Result<ChainId, ChainError> {
        self.with_chain(|chain| {
            chain.ensure_online()?;
            Ok(chain.chain_id())
        })?
    }

    async fn nonce(&self, address: Address) -> Result<u64, ChainError> {
        self.with_chain(|chain| {
            chain.ensure_online()?;
            Ok(chain.next_nonce(address))
        })?
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash, ChainError> {
        self.with_chain(|chain| chain.submit_raw(&raw))?
    }

    async fn transaction(&self, hash: TxHash) -> Result<Option<ChainTransaction>, ChainError> {
        self.with_chain(|chain| chain.transaction(&hash))?
    }

    async fn receipt(&self, hash: TxHash) -> Result<Option<TransactionReceipt>, ChainError> {
        self.with_chain(|chain| chain.receipt(&hash))?
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::{Bytes, U256};
    use peerlend_types::{Address, TransactionEnvelope};

    use super::MockChain;
    use crate::access::ChainError;
    use crate::signing::{address_of, sign_envelope, signer_from_key};

    const KEY: [u8; 32] = [0x11; 32];
    const CONTRACT: Address = Address::new([0xc0; 20]);

    fn envelope(value: u64) -> TransactionEnvelope {
        TransactionEnvelope {
            to: CONTRACT,
            value: U256::from(value),
            gas_limit: 300_000,
            max_fee_per_gas: 2_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            data: Bytes::from(vec![0x01, 0x02, 0x03, 0x04]),
        }
    }

    fn funded_chain() -> (MockChain, Address) {
        let sender = address_of(KEY).expect("valid key");
        let mut chain = MockChain::new(1337);
        chain.fund(sender, U256::from(1_000u64));
        (chain, sender)
    }

    fn signed(value: u64, chain_id: u64, nonce: u64) -> Bytes {
        let signer = signer_from_key(KEY).expect("valid key");
        sign_envelope(&signer, &envelope(value), chain_id, nonce)
            .expect("signs")
            .raw
    }

    #[test]
    fn auto_mined_transfer_moves_value() {
        let (mut chain, sender) = funded_chain();
        let hash = chain.submit_raw(&signed(400, 1337, 0)).expect("accepted");

        let receipt = chain.receipt(&hash).expect("online").expect("mined");
        assert!(receipt.success);
        assert_eq!(receipt.block_number, 1);
        assert_eq!(chain.balance(sender), U256::from(600u64));
        assert_eq!(chain.balance(CONTRACT), U256::from(400u64));
        assert_eq!(chain.next_nonce(sender), 1);
    }

    #[test]
    fn pending_transactions_have_no_receipt_until_mined() {
        let (mut chain, _) = funded_chain();
        chain.set_auto_mine(false);
        let hash = chain.submit_raw(&signed(0, 1337, 0)).expect("accepted");

        assert!(chain.transaction(&hash).expect("online").is_some());
        assert!(chain.receipt(&hash).expect("online").is_none());
        assert_eq!(chain.mine_pending(), 1);
        assert!(chain.receipt(&hash).expect("online").is_some());
    }

    #[test]
    fn rejects_wrong_chain_nonce_and_duplicates() {
        let (mut chain, _) = funded_chain();
        assert!(matches!(
            chain.submit_raw(&signed(0, 1, 0)),
            Err(ChainError::Rejected(_))
        ));
        assert!(matches!(
            chain.submit_raw(&signed(0, 1337, 5)),
            Err(ChainError::Rejected(_))
        ));
        let raw = signed(0, 1337, 0);
        chain.submit_raw(&raw).expect("accepted");
        assert!(matches!(chain.submit_raw(&raw), Err(ChainError::Rejected(_))));
    }

    #[test]
    fn rejects_transfer_above_balance() {
        let (mut chain, _) = funded_chain();
        let err = chain.submit_raw(&signed(5_000, 1337, 0)).unwrap_err();
        assert!(matches!(err, ChainError::Rejected(msg) if msg.contains("insufficient")));
    }

    #[test]
    fn reverted_transaction_keeps_balance() {
        let (mut chain, sender) = funded_chain();
        chain.revert_next_transaction();
        let hash = chain.submit_raw(&signed(400, 1337, 0)).expect("accepted");

        let receipt = chain.receipt(&hash).expect("online").expect("mined");
        assert!(!receipt.success);
        assert_eq!(chain.balance(sender), U256::from(1_000u64));
    }

    #[test]
    fn offline_chain_is_unavailable() {
        let (mut chain, _) = funded_chain();
        chain.set_offline(true);
        assert!(matches!(
            chain.submit_raw(&signed(0, 1337, 0)),
            Err(ChainError::Unavailable(_))
        ));
    }
}
