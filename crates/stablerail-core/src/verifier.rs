//! Mandate chain verification.
//!
//! Flow (first failure wins):
//! 1. Structure: required fields, slot types, validity window ordering
//! 2. Expiry: every `expires_at` strictly after `now`
//! 3. Binding: one merchant domain and one nonce across the chain
//! 4. Amount: payment within cart subtotal + taxes
//! 5. Signatures: issuer key resolution and proof verification
//! 6. Replay: atomic reservation of all three mandate ids
//!
//! Only step 6 mutates state. Protocol failures are returned as a rejected
//! [`VerificationResult`]; `Err` is reserved for infrastructure failures.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stablerail_mandate::MandateChain;
use thiserror::Error;

use crate::keys::{KeyResolver, KeyResolverError};
use crate::replay::{ReplayCache, ReplayError};

#[path = "verifier_internal/mod.rs"]
mod verifier_internal;

/// Why a mandate chain was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[error("malformed mandate")]
    MalformedMandate,

    #[error("mandate expired")]
    MandateExpired,

    #[error("domain or nonce binding mismatch")]
    DomainMismatch,

    #[error("payment amount exceeds cart total")]
    AmountExceedsCart,

    #[error("issuer key could not be resolved")]
    UnknownIssuer,

    #[error("signature malformed")]
    SignatureMalformed,

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("replay detected")]
    ReplayDetected,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedMandate => "malformed_mandate",
            Self::MandateExpired => "mandate_expired",
            Self::DomainMismatch => "domain_mismatch",
            Self::AmountExceedsCart => "amount_exceeds_cart",
            Self::UnknownIssuer => "unknown_issuer",
            Self::SignatureMalformed => "signature_malformed",
            Self::SignatureInvalid => "signature_invalid",
            Self::ReplayDetected => "replay_detected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

impl VerificationResult {
    pub fn accept() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn reject(reason: RejectReason) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
        }
    }
}

/// Infrastructure failure during verification.
#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("Replay store error: {0}")]
    Replay(#[from] ReplayError),

    #[error("Key resolver error: {0}")]
    KeyResolver(#[from] KeyResolverError),
}

/// Verifies Intent → Cart → Payment chains and consumes them.
#[derive(Clone)]
pub struct MandateVerifier {
    resolver: Arc<dyn KeyResolver>,
    replay: Arc<dyn ReplayCache>,
}

impl std::fmt::Debug for MandateVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MandateVerifier").finish_non_exhaustive()
    }
}

impl MandateVerifier {
    pub fn new(resolver: Arc<dyn KeyResolver>, replay: Arc<dyn ReplayCache>) -> Self {
        Self { resolver, replay }
    }

    pub fn replay_cache(&self) -> &Arc<dyn ReplayCache> {
        &self.replay
    }

    /// Verify and, when accepted, consume the chain.
    pub async fn verify_chain(
        &self,
        chain: &MandateChain,
    ) -> Result<VerificationResult, VerifierError> {
        verifier_internal::run::verify_chain_at_impl(self, chain, Utc::now()).await
    }

    /// Like [`verify_chain`](Self::verify_chain) but with an explicit `now`
    /// timestamp. Use this in tests to avoid flaky clock-dependent assertions.
    pub async fn verify_chain_at(
        &self,
        chain: &MandateChain,
        now: DateTime<Utc>,
    ) -> Result<VerificationResult, VerifierError> {
        verifier_internal::run::verify_chain_at_impl(self, chain, now).await
    }

    /// Verify a JSON-encoded chain. Any decoding failure (missing field,
    /// negative or fractional amount, unparsable timestamp) is
    /// `malformed_mandate`.
    pub async fn verify_json(&self, bytes: &[u8]) -> Result<VerificationResult, VerifierError> {
        verifier_internal::run::verify_json_at_impl(self, bytes, Utc::now()).await
    }

    pub async fn verify_json_at(
        &self,
        bytes: &[u8],
        now: DateTime<Utc>,
    ) -> Result<VerificationResult, VerifierError> {
        verifier_internal::run::verify_json_at_impl(self, bytes, now).await
    }
}
