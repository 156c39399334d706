//! Issuer key material for mandate proofs.
//!
//! Two proof algorithms are accepted:
//!
//! | `proof.algorithm` | Curve | Signature encoding |
//! |-------------------|-------|--------------------|
//! | `Ed25519` | Ed25519 | 64 bytes, base64 |
//! | `ES256K` | secp256k1, SHA-256 | 64 bytes `r ‖ s` (low-S), base64 |

use ed25519_dalek::Signer as _;
use k256::ecdsa::signature::Signer as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Signature algorithm declared in `proof.algorithm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProofAlgorithm {
    #[serde(rename = "Ed25519")]
    Ed25519,
    #[serde(rename = "ES256K")]
    Es256k,
}

impl ProofAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ed25519 => "Ed25519",
            Self::Es256k => "ES256K",
        }
    }

    /// Parse the wire name. Accepts the JOSE aliases `EdDSA` and
    /// `EcdsaSecp256k1` as well.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Ed25519" | "EdDSA" => Some(Self::Ed25519),
            "ES256K" | "EcdsaSecp256k1" => Some(Self::Es256k),
            _ => None,
        }
    }
}

impl fmt::Display for ProofAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved issuer public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    Ed25519(ed25519_dalek::VerifyingKey),
    Secp256k1(k256::ecdsa::VerifyingKey),
}

impl PublicKey {
    pub fn ed25519_from_bytes(bytes: &[u8]) -> Result<Self, String> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("ed25519 public key must be 32 bytes, got {}", bytes.len()))?;
        ed25519_dalek::VerifyingKey::from_bytes(&arr)
            .map(Self::Ed25519)
            .map_err(|e| e.to_string())
    }

    pub fn secp256k1_from_sec1(bytes: &[u8]) -> Result<Self, String> {
        k256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
            .map(Self::Secp256k1)
            .map_err(|e| e.to_string())
    }

    pub fn algorithm(&self) -> ProofAlgorithm {
        match self {
            Self::Ed25519(_) => ProofAlgorithm::Ed25519,
            Self::Secp256k1(_) => ProofAlgorithm::Es256k,
        }
    }

    /// Raw key bytes (Ed25519: 32 bytes; secp256k1: compressed SEC1).
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Ed25519(k) => k.to_bytes().to_vec(),
            Self::Secp256k1(k) => k.to_encoded_point(true).as_bytes().to_vec(),
        }
    }

    pub fn key_id(&self) -> String {
        compute_key_id(&self.to_bytes())
    }
}

/// Private key used by mandate issuers (and by tests) to produce proofs.
///
/// The settlement core itself only ever verifies.
#[derive(Clone)]
pub enum MandateSigningKey {
    Ed25519(ed25519_dalek::SigningKey),
    Secp256k1(k256::ecdsa::SigningKey),
}

impl fmt::Debug for MandateSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MandateSigningKey")
            .field("algorithm", &self.algorithm())
            .field("key_id", &self.public_key().key_id())
            .finish()
    }
}

impl MandateSigningKey {
    pub fn ed25519_from_seed(seed: [u8; 32]) -> Self {
        Self::Ed25519(ed25519_dalek::SigningKey::from_bytes(&seed))
    }

    pub fn secp256k1_from_bytes(bytes: &[u8]) -> Result<Self, String> {
        k256::ecdsa::SigningKey::from_slice(bytes)
            .map(Self::Secp256k1)
            .map_err(|e| e.to_string())
    }

    pub fn algorithm(&self) -> ProofAlgorithm {
        match self {
            Self::Ed25519(_) => ProofAlgorithm::Ed25519,
            Self::Secp256k1(_) => ProofAlgorithm::Es256k,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            Self::Ed25519(k) => PublicKey::Ed25519(k.verifying_key()),
            Self::Secp256k1(k) => PublicKey::Secp256k1(*k.verifying_key()),
        }
    }

    /// Sign `message` and return the 64-byte signature.
    pub fn sign_bytes(&self, message: &[u8]) -> Vec<u8> {
        match self {
            Self::Ed25519(k) => k.sign(message).to_bytes().to_vec(),
            Self::Secp256k1(k) => {
                let sig: k256::ecdsa::Signature = k.sign(message);
                sig.to_bytes().to_vec()
            }
        }
    }
}

/// `"sha256:" + lowercase_hex(SHA256(key_bytes))`.
pub fn compute_key_id(key_bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(key_bytes)))
}
