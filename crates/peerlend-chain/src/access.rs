//! Chain access interface shared by signer providers and the server's verifier.

use std::sync::Arc;

use alloy_primitives::{Bytes, U256};
use async_trait::async_trait;
use peerlend_types::{Address, ChainId, TxHash, TransactionReceipt};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("node unavailable: {0}")]
    Unavailable(String),
    #[error("request timed out")]
    Timeout,
    #[error("transaction rejected by node: {0}")]
    Rejected(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("invalid node response: {0}")]
    InvalidResponse(String),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// A transaction as recorded by the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    pub hash: TxHash,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    pub nonce: u64,
    /// Signed 2718 encoding as broadcast.
    pub raw: Bytes,
}

/// Read/broadcast operations against an EVM chain.
#[async_trait]
pub trait ChainAccess: Send + Sync {
    async fn chain_id(&self) -> Result<ChainId, ChainError>;

    /// Next nonce for `address`, counting transactions not yet mined.
    async fn nonce(&self, address: Address) -> Result<u64, ChainError>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash, ChainError>;

    async fn transaction(&self, hash: TxHash) -> Result<Option<ChainTransaction>, ChainError>;

    /// `None` until the transaction is mined.
    async fn receipt(&self, hash: TxHash) -> Result<Option<TransactionReceipt>, ChainError>;
}

#[async_trait]
impl<T> ChainAccess for Arc<T>
where
    T: ChainAccess + ?Sized,
{
    async fn chain_id(&self) -> Result<ChainId, ChainError> {
        (**self).chain_id().await
    }

    async fn nonce(&self, address: Address) -> Result<u64, ChainError> {
        (**self).nonce(address).await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash, ChainError> {
        (**self).send_raw_transaction(raw).await
    }

    async fn transaction(&self, hash: TxHash) -> Result<Option<ChainTransaction>, ChainError> {
        (**self).transaction(hash).await
    }

    async fn receipt(&self, hash: TxHash) -> Result<Option<TransactionReceipt>, ChainError> {
        (**self).receipt(hash).await
    }
}
