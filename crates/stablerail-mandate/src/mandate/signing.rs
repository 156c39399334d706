//! Mandate proof creation and verification.
//!
//! # Signing
//!
//! ```text
//! 1. Assign mandate_id (content id) if the draft has none
//! 2. Build proof {algorithm, verification_method, created, purpose}
//! 3. signing_input = canonical_signing_bytes(mandate)
//! 4. proof.signature = base64(sign(signing_input))
//! ```
//!
//! Verification recomputes step 3 and checks the signature against a key
//! supplied by the caller. Resolving which key an issuer uses is not this
//! crate's concern.

use crate::crypto::keys::{MandateSigningKey, ProofAlgorithm, PublicKey};
use crate::mandate::canonical::canonical_signing_bytes;
use crate::mandate::types::{Mandate, MandateDraft, Proof, PROOF_PURPOSE};
use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use k256::ecdsa::signature::Verifier as _;

const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProofError {
    #[error("unsupported proof algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("signature is not valid base64: {0}")]
    Encoding(String),

    #[error("malformed signature: {reason}")]
    Malformed { reason: String },

    #[error("proof algorithm {declared} does not match issuer key ({key})")]
    AlgorithmMismatch {
        declared: ProofAlgorithm,
        key: ProofAlgorithm,
    },

    #[error("signature verification failed")]
    Invalid,

    #[error("failed to canonicalize mandate: {0}")]
    Canonicalization(String),
}

impl ProofError {
    /// Whether the proof could not even be evaluated, as opposed to being
    /// well-formed but wrong.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedAlgorithm(_)
                | Self::Encoding(_)
                | Self::Malformed { .. }
                | Self::Canonicalization(_)
        )
    }
}

/// Sign a draft, producing a complete mandate.
///
/// `proof.created` is the draft's `created_at`, so signing is deterministic
/// for Ed25519 and for RFC 6979 ECDSA.
pub fn sign_mandate(
    draft: MandateDraft,
    key: &MandateSigningKey,
    verification_method: impl Into<String>,
) -> Result<Mandate> {
    let draft = if draft.mandate_id.is_empty() {
        draft.with_content_id()?
    } else {
        draft
    };

    let proof = Proof {
        algorithm: key.algorithm().as_str().to_string(),
        verification_method: verification_method.into(),
        created: draft.created_at,
        purpose: PROOF_PURPOSE.to_string(),
        signature: String::new(),
    };
    let mut mandate = draft.into_mandate(proof);

    let signing_input = canonical_signing_bytes(&mandate)?;
    mandate.proof.signature = BASE64.encode(key.sign_bytes(&signing_input));
    Ok(mandate)
}

/// Verify `mandate.proof` against `key`.
pub fn verify_proof(mandate: &Mandate, key: &PublicKey) -> Result<(), ProofError> {
    let declared = ProofAlgorithm::parse(&mandate.proof.algorithm)
        .ok_or_else(|| ProofError::UnsupportedAlgorithm(mandate.proof.algorithm.clone()))?;

    let signature_bytes = BASE64
        .decode(&mandate.proof.signature)
        .map_err(|e| ProofError::Encoding(e.to_string()))?;
    if signature_bytes.len() != SIGNATURE_LEN {
        return Err(ProofError::Malformed {
            reason: format!(
                "expected {} signature bytes, got {}",
                SIGNATURE_LEN,
                signature_bytes.len()
            ),
        });
    }

    if declared != key.algorithm() {
        return Err(ProofError::AlgorithmMismatch {
            declared,
            key: key.algorithm(),
        });
    }

    let signing_input = canonical_signing_bytes(mandate)
        .map_err(|e| ProofError::Canonicalization(e.to_string()))?;

    match key {
        PublicKey::Ed25519(vk) => {
            let signature = ed25519_dalek::Signature::from_slice(&signature_bytes).map_err(|e| {
                ProofError::Malformed {
                    reason: format!("invalid signature bytes: {}", e),
                }
            })?;
            vk.verify_strict(&signing_input, &signature)
                .map_err(|_| ProofError::Invalid)
        }
        PublicKey::Secp256k1(vk) => {
            let signature = k256::ecdsa::Signature::from_slice(&signature_bytes).map_err(|e| {
                ProofError::Malformed {
                    reason: format!("invalid signature bytes: {}", e),
                }
            })?;
            vk.verify(&signing_input, &signature)
                .map_err(|_| ProofError::Invalid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mandate::types::{MandateBody, PaymentBody};
    use chrono::{TimeZone, Utc};

    fn payment_draft() -> MandateDraft {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        MandateDraft::new(
            MandateBody::Payment(PaymentBody {
                amount_minor: 1050,
                token: "USDC".into(),
                chain: "base".into(),
                destination: "0x00000000000000000000000000000000000000aa".into(),
                audit_hash: None,
            }),
            "did:example:agent-7",
            "agent-7",
            "n-1",
            "shop.example",
            t,
            t + chrono::Duration::minutes(15),
        )
        .with_mandate_id("pay-1")
    }

    fn ed_key() -> MandateSigningKey {
        MandateSigningKey::ed25519_from_seed([1u8; 32])
    }

    fn k1_key() -> MandateSigningKey {
        MandateSigningKey::secp256k1_from_bytes(&[2u8; 32]).unwrap()
    }

    #[test]
    fn test_sign_and_verify_ed25519() {
        let key = ed_key();
        let mandate = sign_mandate(payment_draft(), &key, "did:example:agent-7#k1").unwrap();
        assert_eq!(mandate.proof.algorithm, "Ed25519");
        assert_eq!(mandate.mandate_id, "pay-1");
        verify_proof(&mandate, &key.public_key()).unwrap();
    }

    #[test]
    fn test_sign_and_verify_es256k() {
        let key = k1_key();
        let mandate = sign_mandate(payment_draft(), &key, "did:example:agent-7#k1").unwrap();
        assert_eq!(mandate.proof.algorithm, "ES256K");
        verify_proof(&mandate, &key.public_key()).unwrap();
    }

    #[test]
    fn test_empty_id_gets_content_id() {
        let draft = payment_draft().with_mandate_id("");
        let mandate = sign_mandate(draft, &ed_key(), "vm").unwrap();
        assert!(mandate.mandate_id.starts_with("sha256:"));
    }

    #[test]
    fn test_tampered_amount_is_invalid() {
        let key = ed_key();
        let mut mandate = sign_mandate(payment_draft(), &key, "vm").unwrap();
        if let MandateBody::Payment(p) = &mut mandate.body {
            p.amount_minor = 9_999;
        }
        assert_eq!(
            verify_proof(&mandate, &key.public_key()),
            Err(ProofError::Invalid)
        );
    }

    #[test]
    fn test_tampered_verification_method_is_invalid() {
        let key = k1_key();
        let mut mandate = sign_mandate(payment_draft(), &key, "vm-1").unwrap();
        mandate.proof.verification_method = "vm-2".into();
        assert_eq!(
            verify_proof(&mandate, &key.public_key()),
            Err(ProofError::Invalid)
        );
    }

    #[test]
    fn test_wrong_key_is_invalid() {
        let mandate = sign_mandate(payment_draft(), &ed_key(), "vm").unwrap();
        let other = MandateSigningKey::ed25519_from_seed([42u8; 32]);
        let err = verify_proof(&mandate, &other.public_key()).unwrap_err();
        assert_eq!(err, ProofError::Invalid);
        assert!(!err.is_malformed());
    }

    #[test]
    fn test_algorithm_key_mismatch() {
        let mandate = sign_mandate(payment_draft(), &ed_key(), "vm").unwrap();
        let err = verify_proof(&mandate, &k1_key().public_key()).unwrap_err();
        assert!(matches!(err, ProofError::AlgorithmMismatch { .. }));
        assert!(!err.is_malformed());
    }

    #[test]
    fn test_bad_base64_is_malformed() {
        let key = ed_key();
        let mut mandate = sign_mandate(payment_draft(), &key, "vm").unwrap();
        mandate.proof.signature = "not base64!!".into();
        let err = verify_proof(&mandate, &key.public_key()).unwrap_err();
        assert!(matches!(err, ProofError::Encoding(_)));
        assert!(err.is_malformed());
    }

    #[test]
    fn test_short_signature_is_malformed() {
        let key = ed_key();
        let mut mandate = sign_mandate(payment_draft(), &key, "vm").unwrap();
        mandate.proof.signature = BASE64.encode([0u8; 10]);
        let err = verify_proof(&mandate, &key.public_key()).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn test_unknown_algorithm_is_malformed() {
        let key = ed_key();
        let mut mandate = sign_mandate(payment_draft(), &key, "vm").unwrap();
        mandate.proof.algorithm = "RS256".into();
        let err = verify_proof(&mandate, &key.public_key()).unwrap_err();
        assert_eq!(err, ProofError::UnsupportedAlgorithm("RS256".into()));
        assert!(err.is_malformed());
    }

    #[test]
    fn test_signature_survives_json_roundtrip() {
        let key = k1_key();
        let mandate = sign_mandate(payment_draft(), &key, "vm").unwrap();
        let json = serde_json::to_string(&mandate).unwrap();
        let parsed: Mandate = serde_json::from_str(&json).unwrap();
        verify_proof(&parsed, &key.public_key()).unwrap();
    }
}
