//! WalletSession: resolves the signing address for the current user.

use std::sync::Arc;

use peerlend_types::Address;
use thiserror::Error;
use tracing::{debug, info};

use crate::signer::{SignerError, SignerProvider};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("wallet is connected as {connected:?} but the user is bound to {bound}")]
    SignerMismatch {
        bound: Address,
        connected: Option<Address>,
    },
    #[error("wallet connection declined: {0}")]
    ConnectDeclined(String),
    #[error(transparent)]
    Provider(#[from] SignerError),
}

/// Resolves "current signer" against the user's bound address, prompting the provider
/// only when nothing is bound yet.
pub struct WalletSession<P> {
    provider: Arc<P>,
}

impl<P> Clone for WalletSession<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
        }
    }
}

impl<P: SignerProvider> WalletSession<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Returns the address to sign with.
    ///
    /// With a bound address, the provider must currently report exactly that address;
    /// anything else is a [`WalletError::SignerMismatch`] and no prompt is shown.
    /// Without one, the provider is asked to connect and the caller must persist the
    /// returned address as a new binding.
    pub async fn ensure_signer(&self, bound: Option<Address>) -> Result<Address, WalletError> {
        match bound {
            Some(bound) => {
                let connected = self.provider.current_address().await;
                if connected == Some(bound) {
                    debug!(address = %bound, "bound signer already connected");
                    Ok(bound)
                } else {
                    Err(WalletError::SignerMismatch { bound, connected })
                }
            }
            None => match self.provider.connect().await {
                Ok(address) => {
                    info!(address = %address, "connected new signer");
                    Ok(address)
                }
                Err(SignerError::Declined(reason)) => Err(WalletError::ConnectDeclined(reason)),
                Err(other) => Err(WalletError::Provider(other)),
            },
        }
    }
}
