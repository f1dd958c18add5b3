//! EIP-1559 signing of server-produced envelopes and decoding of signed bytes.

use alloy_consensus::{transaction::SignableTransaction, TxEip1559, TxEnvelope};
use alloy_eips::eip2718::{Decodable2718, Encodable2718};
use alloy_primitives::{Bytes, TxKind, U256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use peerlend_types::{Address, ChainId, TransactionEnvelope, TxHash};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedSettlement {
    pub raw: Bytes,
    pub hash: TxHash,
}

/// Fields recovered from a signed EIP-1559 transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTx {
    pub hash: TxHash,
    pub from: Address,
    pub chain_id: ChainId,
    pub nonce: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
}

pub fn signer_from_key(private_key: [u8; 32]) -> Result<PrivateKeySigner, SigningError> {
    PrivateKeySigner::from_slice(&private_key).map_err(|e| SigningError::InvalidKey(e.to_string()))
}

pub fn address_of(private_key: [u8; 32]) -> Result<Address, SigningError> {
    Ok(signer_from_key(private_key)?.address().into())
}

/// Signs `envelope` as an EIP-1559 transaction and returns its 2718 encoding.
pub fn sign_envelope(
    signer: &PrivateKeySigner,
    envelope: &TransactionEnvelope,
    chain_id: ChainId,
    nonce: u64,
) -> Result<SignedSettlement, SigningError> {
    let tx = TxEip1559 {
        chain_id,
        nonce,
        gas_limit: envelope.gas_limit,
        max_fee_per_gas: envelope.max_fee_per_gas,
        max_priority_fee_per_gas: envelope.max_priority_fee_per_gas,
        to: TxKind::Call(envelope.to.into()),
        value: envelope.value,
        access_list: Default::default(),
        input: envelope.data.clone(),
    };
    let signature = signer
        .sign_hash_sync(&tx.signature_hash())
        .map_err(|e| SigningError::Signing(e.to_string()))?;
    let signed = tx.into_signed(signature);
    let hash = TxHash::from(*signed.hash());
    let raw = TxEnvelope::from(signed).encoded_2718();
    Ok(SignedSettlement {
        raw: Bytes::from(raw),
        hash,
    })
}

pub fn decode_signed_tx(bytes: &[u8]) -> Result<DecodedTx, String> {
    let envelope =
        TxEnvelope::decode_2718_exact(bytes).map_err(|e| format!("invalid EVM tx: {e}"))?;
    let signed = match &envelope {
        TxEnvelope::Eip1559(signed) => signed,
        _ => return Err("only EIP-1559 settlement transactions are accepted".to_string()),
    };
    let from = signed
        .signature()
        .recover_address_from_prehash(&signed.tx().signature_hash())
        .map_err(|_| "unable to recover tx signer".to_string())?;
    let tx = signed.tx();
    let to = match tx.to {
        TxKind::Call(addr) => Some(Address::from(addr)),
        TxKind::Create => None,
    };
    Ok(DecodedTx {
        hash: TxHash::from(*signed.hash()),
        from: from.into(),
        chain_id: tx.chain_id,
        nonce: tx.nonce,
        to,
        value: tx.value,
        input: tx.input.clone(),
    })
}
