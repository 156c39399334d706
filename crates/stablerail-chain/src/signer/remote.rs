//! Client for a remote threshold (MPC) signing service.
//!
//! ```text
//! POST {url}/v1/sign
//! x-stablerail-key-id:    <key_id>
//! x-stablerail-signature: base64(ed25519_sign(credential, body))
//!
//! body     = JCS({request_id, wallet_id, chain_id, signing_hash, transaction})
//! response = {"r": "0x…", "s": "0x…", "y_parity": 0 | 1}
//! ```
//!
//! Requests are never retried here. A lost response may still have produced
//! a signature on the service side, and the executor must not sign the same
//! nonce twice behind the caller's back.

use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signer as _, SigningKey};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::TransactionSigner;
use crate::config::RemoteSignerConfig;
use crate::error::{ChainError, ChainResult};
use crate::tx::{recover_sender, Eip1559Transaction, TxSignature};

pub const KEY_ID_HEADER: &str = "x-stablerail-key-id";
pub const SIGNATURE_HEADER: &str = "x-stablerail-signature";

const USER_AGENT_VALUE: &str = concat!("stablerail-chain/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    request_id: String,
    wallet_id: &'a str,
    chain_id: u64,
    signing_hash: String,
    transaction: TxFields,
}

#[derive(Debug, Serialize)]
struct TxFields {
    nonce: u64,
    to: String,
    value: String,
    data: String,
    gas_limit: u64,
    max_fee_per_gas: String,
    max_priority_fee_per_gas: String,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    r: String,
    s: String,
    y_parity: u8,
}

pub struct RemoteMpcSigner {
    client: reqwest::Client,
    endpoint: String,
    key_id: String,
    credential: SigningKey,
}

impl std::fmt::Debug for RemoteMpcSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMpcSigner")
            .field("endpoint", &self.endpoint)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl RemoteMpcSigner {
    pub fn new(config: &RemoteSignerConfig) -> ChainResult<Self> {
        let seed = BASE64
            .decode(config.credential.trim())
            .map_err(|e| ChainError::Config {
                message: format!("signer credential is not base64: {}", e),
            })?;
        let seed: [u8; 32] = seed.as_slice().try_into().map_err(|_| ChainError::Config {
            message: format!("signer credential must be 32 bytes, got {}", seed.len()),
        })?;

        let base = url::Url::parse(&config.url).map_err(|e| ChainError::Config {
            message: format!("invalid signer url {}: {}", config.url, e),
        })?;
        let endpoint = format!("{}/v1/sign", base.as_str().trim_end_matches('/'));

        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(default_headers)
            .build()
            .map_err(|e| ChainError::Config {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint,
            key_id: config.key_id.clone(),
            credential: SigningKey::from_bytes(&seed),
        })
    }

    fn request_body(&self, wallet_id: &str, tx: &Eip1559Transaction) -> ChainResult<Vec<u8>> {
        let request = SignRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            wallet_id,
            chain_id: tx.chain_id,
            signing_hash: format!("0x{}", hex::encode(tx.signing_hash())),
            transaction: TxFields {
                nonce: tx.nonce,
                to: tx.to.to_checksum(None),
                value: tx.value.to_string(),
                data: format!("0x{}", hex::encode(&tx.data)),
                gas_limit: tx.gas_limit,
                max_fee_per_gas: tx.max_fee_per_gas.to_string(),
                max_priority_fee_per_gas: tx.max_priority_fee_per_gas.to_string(),
            },
        };
        serde_jcs::to_vec(&request).map_err(|e| ChainError::SignerRejected {
            message: format!("failed to canonicalize sign request: {}", e),
        })
    }
}

#[async_trait]
impl TransactionSigner for RemoteMpcSigner {
    fn name(&self) -> &'static str {
        "remote_mpc"
    }

    async fn sign_hash(&self, wallet_id: &str, tx: &Eip1559Transaction) -> ChainResult<TxSignature> {
        let body = self.request_body(wallet_id, tx)?;
        let request_signature = BASE64.encode(self.credential.sign(&body).to_bytes());

        debug!(wallet_id, nonce = tx.nonce, endpoint = %self.endpoint, "requesting remote signature");

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(KEY_ID_HEADER, &self.key_id)
            .header(SIGNATURE_HEADER, request_signature)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!(wallet_id, error = %e, "signer unreachable");
                ChainError::SignerUnavailable {
                    message: e.to_string(),
                }
            })?;

        let status = response.status();
        match status.as_u16() {
            200..=299 => {}
            429 | 500..=599 => {
                error!(wallet_id, status = status.as_u16(), "signer unavailable");
                return Err(ChainError::SignerUnavailable {
                    message: format!("HTTP {}", status),
                });
            }
            _ => {
                let text = response.text().await.unwrap_or_default();
                error!(wallet_id, status = status.as_u16(), body = %text, "signer rejected request");
                return Err(ChainError::SignerRejected {
                    message: format!("HTTP {}: {}", status, text),
                });
            }
        }

        let parsed: SignResponse = response
            .json()
            .await
            .map_err(|e| ChainError::SignerResponse {
                message: format!("malformed body: {}", e),
            })?;

        let signature = TxSignature {
            r: parse_scalar(&parsed.r, "r")?,
            s: parse_scalar(&parsed.s, "s")?,
            y_parity: match parsed.y_parity {
                0 => false,
                1 => true,
                other => {
                    return Err(ChainError::SignerResponse {
                        message: format!("y_parity must be 0 or 1, got {}", other),
                    })
                }
            },
        };

        recover_sender(tx, &signature).map_err(|e| ChainError::SignerResponse {
            message: format!("signature does not recover: {}", e),
        })?;

        Ok(signature)
    }
}

fn parse_scalar(value: &str, field: &str) -> ChainResult<U256> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    U256::from_str_radix(digits, 16).map_err(|e| ChainError::SignerResponse {
        message: format!("{} is not a hex scalar: {}", field, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalized() {
        let signer = RemoteMpcSigner::new(&RemoteSignerConfig {
            url: "https://signer.internal/".into(),
            key_id: "core-01".into(),
            credential: BASE64.encode([1u8; 32]),
            timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(signer.endpoint, "https://signer.internal/v1/sign");
    }

    #[test]
    fn test_parse_scalar() {
        assert_eq!(parse_scalar("0x0a", "r").unwrap(), U256::from(10u64));
        assert_eq!(parse_scalar("ff", "r").unwrap(), U256::from(255u64));
        assert!(parse_scalar("0xzz", "r").is_err());
    }
}
