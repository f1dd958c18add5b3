//! Ethereum JSON-RPC front for a [`ChainAccess`], so wallets outside the process can
//! reach the chain the server verifies against. Serves the methods `EthRpcClient` uses,
//! in the shapes a node returns them.

use std::sync::Arc;

use alloy_consensus::transaction::Recovered;
use alloy_consensus::{Eip658Value, Receipt, ReceiptEnvelope, ReceiptWithBloom, TxEnvelope};
use alloy_eips::eip2718::Decodable2718;
use alloy_primitives::{keccak256, Bloom, Bytes, B256, U64};
use alloy_rpc_types_eth::{Transaction as RpcTransaction, TransactionReceipt as RpcReceipt};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use peerlend_chain::{ChainAccess, ChainError, ChainTransaction};
use peerlend_types::{Address, TransactionReceipt, TxHash};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

#[derive(Clone, Copy, Debug)]
#[repr(i64)]
enum RpcErrorCode {
    ParseError = -32700,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
    /// Node-side refusal of a transaction, as geth reports it.
    TransactionRejected = -32000,
}

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

struct RpcFailure {
    code: RpcErrorCode,
    message: String,
}

impl From<ChainError> for RpcFailure {
    fn from(err: ChainError) -> Self {
        let code = match err {
            ChainError::Rejected(_) => RpcErrorCode::TransactionRejected,
            _ => RpcErrorCode::InternalError,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

pub fn router(chain: Arc<dyn ChainAccess>) -> Router {
    Router::new()
        .route("/rpc", post(handle_rpc))
        .with_state(chain)
}

async fn handle_rpc(State(chain): State<Arc<dyn ChainAccess>>, body: String) -> Json<Value> {
    let request = match serde_json::from_str::<JsonRpcRequest>(&body) {
        Ok(request) => request,
        Err(err) => {
            return Json(json_err(
                Value::Null,
                RpcFailure {
                    code: RpcErrorCode::ParseError,
                    message: err.to_string(),
                },
            ))
        }
    };
    debug!(method = %request.method, "rpc request");
    let id = request.id.clone();
    match dispatch(chain.as_ref(), &request).await {
        Ok(result) => Json(json!({ "jsonrpc": "2.0", "id": id, "result": result })),
        Err(failure) => Json(json_err(id, failure)),
    }
}

async fn dispatch(chain: &dyn ChainAccess, request: &JsonRpcRequest) -> Result<Value, RpcFailure> {
    match request.method.as_str() {
        "eth_chainId" => Ok(json!(U64::from(chain.chain_id().await?))),
        "eth_getTransactionCount" => {
            let address: Address = param(&request.params, 0)?;
            Ok(json!(U64::from(chain.nonce(address).await?)))
        }
        "eth_sendRawTransaction" => {
            let raw: Bytes = param(&request.params, 0)?;
            Ok(json!(chain.send_raw_transaction(raw).await?))
        }
        "eth_getTransactionByHash" => {
            let hash: TxHash = param(&request.params, 0)?;
            let Some(tx) = chain.transaction(hash).await? else {
                return Ok(Value::Null);
            };
            let receipt = chain.receipt(hash).await?;
            Ok(json!(node_transaction(&tx, receipt.as_ref())?))
        }
        "eth_getTransactionReceipt" => {
            let hash: TxHash = param(&request.params, 0)?;
            match (chain.receipt(hash).await?, chain.transaction(hash).await?) {
                (Some(receipt), Some(tx)) => Ok(json!(node_receipt(&tx, &receipt))),
                _ => Ok(Value::Null),
            }
        }
        other => Err(RpcFailure {
            code: RpcErrorCode::MethodNotFound,
            message: format!("method {other} not supported"),
        }),
    }
}

fn block_hash(number: u64) -> B256 {
    keccak256(number.to_be_bytes())
}

/// Rebuilds the node's view of a transaction from the signed bytes the chain recorded.
fn node_transaction(
    tx: &ChainTransaction,
    receipt: Option<&TransactionReceipt>,
) -> Result<RpcTransaction, RpcFailure> {
    let envelope = TxEnvelope::decode_2718_exact(&tx.raw).map_err(|e| RpcFailure {
        code: RpcErrorCode::InternalError,
        message: format!("stored transaction {} does not decode: {e}", tx.hash),
    })?;
    Ok(RpcTransaction {
        inner: Recovered::new_unchecked(envelope, tx.from.into()),
        block_hash: receipt.map(|r| block_hash(r.block_number)),
        block_number: receipt.map(|r| r.block_number),
        transaction_index: receipt.map(|_| 0),
        effective_gas_price: None,
    })
}

fn node_receipt(tx: &ChainTransaction, receipt: &TransactionReceipt) -> RpcReceipt {
    RpcReceipt {
        inner: ReceiptEnvelope::Eip1559(ReceiptWithBloom {
            receipt: Receipt {
                status: Eip658Value::Eip658(receipt.success),
                cumulative_gas_used: 0,
                logs: Vec::new(),
            },
            logs_bloom: Bloom::default(),
        }),
        transaction_hash: receipt.tx_hash.into(),
        transaction_index: Some(0),
        block_hash: Some(block_hash(receipt.block_number)),
        block_number: Some(receipt.block_number),
        gas_used: 0,
        effective_gas_price: 0,
        blob_gas_used: None,
        blob_gas_price: None,
        from: tx.from.into(),
        to: tx.to.map(Into::into),
        contract_address: None,
    }
}

fn param<T: DeserializeOwned>(params: &Value, index: usize) -> Result<T, RpcFailure> {
    let value = params.get(index).cloned().ok_or_else(|| RpcFailure {
        code: RpcErrorCode::InvalidParams,
        message: format!("missing param {index}"),
    })?;
    serde_json::from_value(value).map_err(|e| RpcFailure {
        code: RpcErrorCode::InvalidParams,
        message: format!("param {index}: {e}"),
    })
}

fn json_err(id: Value, failure: RpcFailure) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": JsonRpcErrorBody {
            code: failure.code as i64,
            message: failure.message,
        },
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use peerlend_chain::scenarios::BOB_KEY;
    use peerlend_chain::{
        sign_envelope, signer_from_key, ChainAccess, ChainError, DemoScenario, EthRpcClient,
    };
    use peerlend_types::TransactionEnvelope;

    use super::router;

    async fn serve(scenario: &DemoScenario) -> EthRpcClient {
        let app = router(Arc::new(scenario.chain.clone()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        EthRpcClient::new(format!("http://{addr}/rpc"), Duration::from_secs(2)).expect("client")
    }

    #[tokio::test]
    async fn rpc_client_round_trips_through_gateway() {
        let scenario = DemoScenario::new(1337).expect("scenario");
        let client = serve(&scenario).await;
        assert_eq!(client.chain_id().await.expect("chain id"), 1337);
        assert_eq!(client.nonce(scenario.accounts.bob).await.expect("nonce"), 0);

        let envelope = TransactionEnvelope {
            to: scenario.contract,
            value: alloy_primitives::U256::from(77u64),
            gas_limit: 300_000,
            max_fee_per_gas: 2_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            data: alloy_primitives::Bytes::from(vec![0x01, 0x02]),
        };
        let signer = signer_from_key(BOB_KEY).expect("key");
        let signed = sign_envelope(&signer, &envelope, 1337, 0).expect("signed");
        let hash = client
            .send_raw_transaction(signed.raw.clone())
            .await
            .expect("sent");
        assert_eq!(hash, signed.hash);

        let tx = client.transaction(hash).await.expect("lookup").expect("found");
        assert_eq!(tx.from, scenario.accounts.bob);
        assert_eq!(tx.to, Some(scenario.contract));
        assert_eq!(tx.input, envelope.data);
        let receipt = client.receipt(hash).await.expect("lookup").expect("mined");
        assert!(receipt.success);
        assert_eq!(client.nonce(scenario.accounts.bob).await.expect("nonce"), 1);

        let replay = client.send_raw_transaction(signed.raw).await.unwrap_err();
        assert!(matches!(replay, ChainError::Rejected(_)), "{replay:?}");
        assert!(client
            .receipt(peerlend_types::TxHash::new([3; 32]))
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn pending_transaction_is_served_before_its_receipt() {
        let scenario = DemoScenario::new(1337).expect("scenario");
        scenario
            .chain
            .with_chain(|c| c.set_auto_mine(false))
            .expect("lock");
        let client = serve(&scenario).await;

        let envelope = TransactionEnvelope {
            to: scenario.contract,
            value: alloy_primitives::U256::from(5u64),
            gas_limit: 300_000,
            max_fee_per_gas: 2_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            data: alloy_primitives::Bytes::new(),
        };
        let signer = signer_from_key(BOB_KEY).expect("key");
        let signed = sign_envelope(&signer, &envelope, 1337, 0).expect("signed");
        let hash = client.send_raw_transaction(signed.raw.clone()).await.expect("sent");

        let tx = client.transaction(hash).await.expect("lookup").expect("pending");
        assert_eq!(tx.raw, signed.raw);
        assert_eq!(tx.value, envelope.value);
        assert!(client.receipt(hash).await.expect("lookup").is_none());

        scenario
            .chain
            .with_chain(|c| c.mine_pending())
            .expect("lock");
        let receipt = client.receipt(hash).await.expect("lookup").expect("mined");
        assert_eq!(receipt.block_number, 1);
        assert!(receipt.success);
    }
}
