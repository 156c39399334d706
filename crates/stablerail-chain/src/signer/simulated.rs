use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::TransactionSigner;
use crate::error::{ChainError, ChainResult};
use crate::tx::{address_of, Eip1559Transaction, TxSignature};

/// Local signer with keys derived as `SHA256(seed || ":" || wallet_id)`.
///
/// For development and tests only. Performs no I/O.
#[derive(Clone)]
pub struct SimulatedSigner {
    seed: Vec<u8>,
}

impl std::fmt::Debug for SimulatedSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedSigner").finish_non_exhaustive()
    }
}

impl SimulatedSigner {
    pub fn new(seed: &[u8]) -> Self {
        Self {
            seed: seed.to_vec(),
        }
    }

    fn key_for(&self, wallet_id: &str) -> ChainResult<SigningKey> {
        let mut hasher = Sha256::new();
        hasher.update(&self.seed);
        hasher.update(b":");
        hasher.update(wallet_id.as_bytes());
        let digest = hasher.finalize();
        SigningKey::from_slice(digest.as_slice()).map_err(|e| ChainError::SignerRejected {
            message: format!("cannot derive key for {}: {}", wallet_id, e),
        })
    }

    /// On-chain address of `wallet_id` under this seed.
    pub fn address_for(&self, wallet_id: &str) -> ChainResult<Address> {
        Ok(address_of(self.key_for(wallet_id)?.verifying_key()))
    }
}

#[async_trait]
impl TransactionSigner for SimulatedSigner {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn sign_hash(&self, wallet_id: &str, tx: &Eip1559Transaction) -> ChainResult<TxSignature> {
        let key = self.key_for(wallet_id)?;
        let hash = tx.signing_hash();
        let (signature, recid) =
            key.sign_prehash_recoverable(hash.as_slice())
                .map_err(|e| ChainError::SignerRejected {
                    message: e.to_string(),
                })?;

        debug!(wallet_id, nonce = tx.nonce, "simulated signature");

        let bytes = signature.to_bytes();
        Ok(TxSignature {
            r: U256::from_be_slice(&bytes[..32]),
            s: U256::from_be_slice(&bytes[32..]),
            y_parity: recid.is_y_odd(),
        })
    }
}
