//! Transaction signing capability.
//!
//! The executor never holds key material. It hands an unsigned transaction
//! and a wallet id to a [`TransactionSigner`] and gets the broadcastable
//! envelope back.

pub mod remote;
pub mod simulated;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SignerConfig;
use crate::error::ChainResult;
use crate::tx::{Eip1559Transaction, SignedTransaction, TxSignature};

pub use remote::RemoteMpcSigner;
pub use simulated::SimulatedSigner;

#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Short name for logs (`simulated`, `remote_mpc`).
    fn name(&self) -> &'static str;

    /// Produce a signature over `tx.signing_hash()` with the key of
    /// `wallet_id`.
    async fn sign_hash(&self, wallet_id: &str, tx: &Eip1559Transaction) -> ChainResult<TxSignature>;

    /// Sign and encode `tx`.
    async fn sign(&self, wallet_id: &str, tx: &Eip1559Transaction) -> ChainResult<SignedTransaction> {
        let signature = self.sign_hash(wallet_id, tx).await?;
        Ok(tx.clone().into_signed(signature))
    }
}

/// Build the signer selected by configuration.
pub fn build_signer(config: &SignerConfig) -> ChainResult<Arc<dyn TransactionSigner>> {
    match config {
        SignerConfig::Simulated { seed } => Ok(Arc::new(SimulatedSigner::new(seed.as_bytes()))),
        SignerConfig::RemoteMpc(remote) => Ok(Arc::new(RemoteMpcSigner::new(remote)?)),
    }
}
