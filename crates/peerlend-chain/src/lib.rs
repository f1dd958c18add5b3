//! Chain access for loan settlement: JSON-RPC, an in-memory chain for tests, and EIP-1559 signing.

pub mod access;
pub mod mock_chain;
pub mod rpc;
pub mod scenarios;
pub mod signing;

pub use access::{ChainAccess, ChainError, ChainTransaction};
pub use mock_chain::{MockChain, SharedMockChain};
pub use rpc::EthRpcClient;
pub use scenarios::{DemoAccounts, DemoScenario};
pub use signing::{
    address_of, decode_signed_tx, sign_envelope, signer_from_key, DecodedTx, SignedSettlement,
    SigningError,
};
