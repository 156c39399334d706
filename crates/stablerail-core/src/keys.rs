//! Issuer key resolution.
//!
//! The core never resolves DIDs itself; it consumes a [`KeyResolver`] that
//! maps an issuer identifier to its current verification key.

use std::collections::HashMap;

use async_trait::async_trait;
use stablerail_mandate::{ProofAlgorithm, PublicKey};
use thiserror::Error;

/// A verification key as published by its issuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    /// The key's identifier, e.g. `did:web:shop.example#key-1`. A proof's
    /// `verification_method` must name it exactly.
    pub verification_method: String,
    pub public_key: PublicKey,
}

impl ResolvedKey {
    pub fn new(verification_method: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            verification_method: verification_method.into(),
            public_key,
        }
    }

    pub fn algorithm(&self) -> ProofAlgorithm {
        self.public_key.algorithm()
    }
}

/// Infrastructure failure while resolving; "no such issuer" is `Ok(None)`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("key resolution failed for {issuer}: {message}")]
pub struct KeyResolverError {
    pub issuer: String,
    pub message: String,
}

#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, issuer: &str) -> Result<Option<ResolvedKey>, KeyResolverError>;
}

/// Fixed issuer → key table, for tests and closed deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyResolver {
    keys: HashMap<String, ResolvedKey>,
}

impl StaticKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(
        mut self,
        issuer: impl Into<String>,
        verification_method: impl Into<String>,
        public_key: PublicKey,
    ) -> Self {
        self.insert(issuer, ResolvedKey::new(verification_method, public_key));
        self
    }

    pub fn insert(&mut self, issuer: impl Into<String>, key: ResolvedKey) {
        self.keys.insert(issuer.into(), key);
    }
}

#[async_trait]
impl KeyResolver for StaticKeyResolver {
    async fn resolve(&self, issuer: &str) -> Result<Option<ResolvedKey>, KeyResolverError> {
        Ok(self.keys.get(issuer).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stablerail_mandate::MandateSigningKey;

    #[tokio::test]
    async fn test_static_resolver() {
        let key = MandateSigningKey::ed25519_from_seed([3u8; 32]).public_key();
        let resolver =
            StaticKeyResolver::new().with_key("did:example:alice", "did:example:alice#key-1", key);

        let resolved = resolver.resolve("did:example:alice").await.unwrap().unwrap();
        assert_eq!(resolved.verification_method, "did:example:alice#key-1");
        assert_eq!(resolved.algorithm(), ProofAlgorithm::Ed25519);
        assert!(resolver.resolve("did:example:bob").await.unwrap().is_none());
    }
}
