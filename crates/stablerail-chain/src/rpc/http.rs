//! JSON-RPC over HTTP.
//!
//! Single attempt per call; retrying is the caller's decision (see
//! [`RetryPolicy`](super::RetryPolicy)). Status handling lives here only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{CallRequest, ChainRpc, RpcReceipt};
use crate::error::{ChainError, ChainResult};

const USER_AGENT_VALUE: &str = concat!("stablerail-chain/", env!("CARGO_PKG_VERSION"));

/// JSON-RPC "method not found".
const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug)]
pub struct JsonRpcClient {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> ChainResult<Self> {
        let url = url.into();
        url::Url::parse(&url).map_err(|e| ChainError::Config {
            message: format!("invalid rpc url {}: {}", url, e),
        })?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()
            .map_err(|e| ChainError::Config {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            url,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Perform one call and return the raw `result` (possibly `null`).
    pub async fn call(&self, method: &str, params: Value) -> ChainResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();

        match status.as_u16() {
            200..=299 => {}
            429 | 500..=599 => {
                return Err(ChainError::RpcUnavailable {
                    message: format!("{} returned HTTP {}", method, status),
                })
            }
            _ => {
                let text = response.text().await.unwrap_or_default();
                return Err(ChainError::InvalidResponse {
                    message: format!("{} returned HTTP {}: {}", method, status, text),
                });
            }
        }

        let envelope: RpcEnvelope =
            response
                .json()
                .await
                .map_err(|e| ChainError::InvalidResponse {
                    message: format!("{}: malformed json-rpc body: {}", method, e),
                })?;

        if let Some(err) = envelope.error {
            debug!(method, code = err.code, message = %err.message, "json-rpc error");
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        Ok(envelope.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ChainRpc for JsonRpcClient {
    async fn pending_nonce(&self, address: Address) -> ChainResult<u64> {
        let result = self
            .call(
                "eth_getTransactionCount",
                json!([address.to_checksum(None), "pending"]),
            )
            .await?;
        parse_quantity_u64(&result, "eth_getTransactionCount")
    }

    async fn base_fee(&self) -> ChainResult<u128> {
        let block = self
            .call("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        let fee = block
            .get("baseFeePerGas")
            .ok_or_else(|| ChainError::InvalidResponse {
                message: "latest block has no baseFeePerGas".to_string(),
            })?;
        parse_quantity_u128(fee, "baseFeePerGas")
    }

    async fn max_priority_fee(&self) -> ChainResult<Option<u128>> {
        match self.call("eth_maxPriorityFeePerGas", json!([])).await {
            Ok(value) => parse_quantity_u128(&value, "eth_maxPriorityFeePerGas").map(Some),
            Err(ChainError::Rpc { code, .. }) if code == METHOD_NOT_FOUND => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn estimate_gas(&self, call: &CallRequest) -> ChainResult<u64> {
        let result = self
            .call(
                "eth_estimateGas",
                json!([{
                    "from": call.from.to_checksum(None),
                    "to": call.to.to_checksum(None),
                    "value": format!("0x{:x}", call.value),
                    "data": format!("0x{}", hex::encode(&call.data)),
                }]),
            )
            .await?;
        parse_quantity_u64(&result, "eth_estimateGas")
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> ChainResult<B256> {
        let result = self
            .call(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(raw))]),
            )
            .await
            .map_err(classify_broadcast_error)?;
        let hash = result.as_str().ok_or_else(|| ChainError::InvalidResponse {
            message: "eth_sendRawTransaction returned no hash".to_string(),
        })?;
        hash.parse::<B256>()
            .map_err(|e| ChainError::InvalidResponse {
                message: format!("invalid transaction hash {}: {}", hash, e),
            })
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> ChainResult<Option<RpcReceipt>> {
        let result = self
            .call(
                "eth_getTransactionReceipt",
                json!([format!("0x{}", hex::encode(tx_hash))]),
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }

        let block = result
            .get("blockNumber")
            .filter(|v| !v.is_null())
            .ok_or_else(|| ChainError::InvalidResponse {
                message: "receipt without blockNumber".to_string(),
            })?;
        let status = result
            .get("status")
            .ok_or_else(|| ChainError::InvalidResponse {
                message: "receipt without status".to_string(),
            })?;

        Ok(Some(RpcReceipt {
            block_number: parse_quantity_u64(block, "blockNumber")?,
            success: parse_quantity_u64(status, "status")? == 1,
            revert_reason: result
                .get("revertReason")
                .and_then(Value::as_str)
                .map(String::from),
        }))
    }

    async fn block_number(&self) -> ChainResult<u64> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity_u64(&result, "eth_blockNumber")
    }
}

/// Map node rejections of a raw transaction onto typed errors. The wording
/// differs between clients (geth, erigon, nethermind, reth).
fn classify_broadcast_error(err: ChainError) -> ChainError {
    match err {
        ChainError::Rpc { code, message } => {
            let lower = message.to_ascii_lowercase();
            if lower.contains("already known")
                || lower.contains("known transaction")
                || lower.contains("already imported")
                || lower.contains("alreadyknown")
            {
                ChainError::AlreadyKnown { message }
            } else if lower.contains("nonce too low")
                || lower.contains("nonce is too low")
                || lower.contains("old nonce")
            {
                ChainError::StaleNonce { message }
            } else {
                ChainError::BroadcastRejected {
                    message: format!("{} ({})", message, code),
                }
            }
        }
        other => other,
    }
}

fn quantity_str<'a>(value: &'a Value, field: &str) -> ChainResult<&'a str> {
    value
        .as_str()
        .and_then(|s| s.strip_prefix("0x"))
        .ok_or_else(|| ChainError::InvalidResponse {
            message: format!("{}: expected hex quantity, got {}", field, value),
        })
}

pub(crate) fn parse_quantity_u64(value: &Value, field: &str) -> ChainResult<u64> {
    let digits = quantity_str(value, field)?;
    u64::from_str_radix(digits, 16).map_err(|e| ChainError::InvalidResponse {
        message: format!("{}: {}", field, e),
    })
}

pub(crate) fn parse_quantity_u128(value: &Value, field: &str) -> ChainResult<u128> {
    let digits = quantity_str(value, field)?;
    u128::from_str_radix(digits, 16).map_err(|e| ChainError::InvalidResponse {
        message: format!("{}: {}", field, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity_u64(&json!("0x1a"), "f").unwrap(), 26);
        assert_eq!(parse_quantity_u64(&json!("0x0"), "f").unwrap(), 0);
        assert!(parse_quantity_u64(&json!("1a"), "f").is_err());
        assert!(parse_quantity_u64(&json!(26), "f").is_err());
        assert_eq!(
            parse_quantity_u128(&json!("0x3b9aca00"), "f").unwrap(),
            1_000_000_000
        );
    }

    #[test]
    fn test_classify_stale_nonce_variants() {
        for message in ["nonce too low", "Nonce is too low: next 7", "old nonce"] {
            let err = classify_broadcast_error(ChainError::Rpc {
                code: -32000,
                message: message.into(),
            });
            assert!(matches!(err, ChainError::StaleNonce { .. }), "{}", message);
        }

        for message in ["already known", "Known transaction: 0xab12", "AlreadyKnown"] {
            let err = classify_broadcast_error(ChainError::Rpc {
                code: -32000,
                message: message.into(),
            });
            assert!(matches!(err, ChainError::AlreadyKnown { .. }), "{}", message);
        }

        let err = classify_broadcast_error(ChainError::Rpc {
            code: -32000,
            message: "insufficient funds for gas * price + value".into(),
        });
        assert!(matches!(err, ChainError::BroadcastRejected { .. }));

        let err = classify_broadcast_error(ChainError::RpcUnavailable {
            message: "timeout".into(),
        });
        assert!(err.is_retryable());
    }

    #[test]
    fn test_rejects_invalid_url() {
        assert!(matches!(
            JsonRpcClient::new("not a url", Duration::from_secs(1)),
            Err(ChainError::Config { .. })
        ));
    }
}
