//! Ethereum node access over HTTP JSON-RPC.

use std::future::IntoFuture;
use std::time::Duration;

use alloy_eips::eip2718::Encodable2718;
use alloy_network::TransactionResponse;
use alloy_primitives::Bytes;
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_transport::{RpcError, TransportError};
use async_trait::async_trait;
use peerlend_types::{Address, ChainId, TransactionReceipt, TxHash};
use tracing::debug;

use crate::access::{ChainAccess, ChainError, ChainTransaction};

/// [`ChainAccess`] backed by an alloy HTTP provider.
pub struct EthRpcClient {
    provider: DynProvider,
    timeout: Duration,
}

impl EthRpcClient {
    pub fn new(rpc_url: impl AsRef<str>, timeout: Duration) -> Result<Self, ChainError> {
        let url = rpc_url
            .as_ref()
            .parse::<reqwest::Url>()
            .map_err(|e| ChainError::Unavailable(format!("invalid rpc url: {e}")))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        Ok(Self { provider, timeout })
    }

    async fn call<T, F>(&self, method: &'static str, request: F) -> Result<T, ChainError>
    where
        F: IntoFuture<Output = Result<T, TransportError>>,
    {
        debug!(method, "eth rpc call");
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(map_transport_error),
            Err(_) => Err(ChainError::Timeout),
        }
    }
}

#[async_trait]
impl ChainAccess for EthRpcClient {
    async fn chain_id(&self) -> Result<ChainId, ChainError> {
        self.call("eth_chainId", self.provider.get_chain_id()).await
    }

    async fn nonce(&self, address: Address) -> Result<u64, ChainError> {
        self.call(
            "eth_getTransactionCount",
            self.provider.get_transaction_count(address.into()).pending(),
        )
        .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<TxHash, ChainError> {
        match self
            .call("eth_sendRawTransaction", self.provider.send_raw_transaction(&raw))
            .await
        {
            Ok(pending) => Ok(TxHash::from(*pending.tx_hash())),
            Err(ChainError::Rpc { message, .. }) => Err(ChainError::Rejected(message)),
            Err(other) => Err(other),
        }
    }

    async fn transaction(&self, hash: TxHash) -> Result<Option<ChainTransaction>, ChainError> {
        let tx = self
            .call(
                "eth_getTransactionByHash",
                self.provider.get_transaction_by_hash(hash.into()),
            )
            .await?;
        Ok(tx.map(|tx| ChainTransaction {
            hash: TransactionResponse::tx_hash(&tx).into(),
            from: TransactionResponse::from(&tx).into(),
            to: alloy_consensus::Transaction::to(&tx).map(Address::from),
            value: alloy_consensus::Transaction::value(&tx),
            input: alloy_consensus::Transaction::input(&tx).clone(),
            nonce: alloy_consensus::Transaction::nonce(&tx),
            raw: Bytes::from(tx.inner.inner().encoded_2718()),
        }))
    }

    async fn receipt(&self, hash: TxHash) -> Result<Option<TransactionReceipt>, ChainError> {
        let receipt = self
            .call(
                "eth_getTransactionReceipt",
                self.provider.get_transaction_receipt(hash.into()),
            )
            .await?;
        Ok(receipt.map(|r| TransactionReceipt {
            tx_hash: r.transaction_hash.into(),
            block_number: r.block_number.unwrap_or_default(),
            success: r.status(),
        }))
    }
}

fn map_transport_error(err: TransportError) -> ChainError {
    match err {
        RpcError::ErrorResp(payload) => ChainError::Rpc {
            code: payload.code,
            message: payload.message.to_string(),
        },
        RpcError::Transport(kind) => ChainError::Unavailable(kind.to_string()),
        other => ChainError::InvalidResponse(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::EthRpcClient;
    use crate::access::{ChainAccess, ChainError};

    #[test]
    fn malformed_url_is_refused() {
        assert!(matches!(
            EthRpcClient::new("not a url", Duration::from_secs(1)),
            Err(ChainError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn closed_port_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client =
            EthRpcClient::new(format!("http://{addr}"), Duration::from_secs(2)).expect("client");
        let err = client.chain_id().await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }
}
