//! RFC 8785 canonical JSON.
//!
//! Every byte string that is hashed or signed in this workspace goes through
//! here, so two parties holding the same value always agree on its bytes:
//! keys sorted, no insignificant whitespace, UTF-8, integers without
//! exponent or fraction.

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serialize a value to canonical JSON bytes.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_jcs::to_vec(value).context("failed to serialize canonical json")
}

/// `"sha256:" + lowercase_hex(SHA256(JCS(value)))`.
pub fn sha256_digest<T: Serialize>(value: &T) -> Result<String> {
    let canonical = to_vec(value)?;
    Ok(format!("sha256:{}", hex::encode(Sha256::digest(&canonical))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_and_compact() {
        let value = json!({
            "subtotal_minor": 1000,
            "merchant_domain": "shop.example",
            "items": [{"sku": "A1", "quantity": 2}]
        });
        let bytes = to_vec(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"items":[{"quantity":2,"sku":"A1"}],"merchant_domain":"shop.example","subtotal_minor":1000}"#
        );
    }

    #[test]
    fn test_digest_is_order_independent() {
        let a = json!({"nonce": "n-1", "domain": "shop.example"});
        let b = json!({"domain": "shop.example", "nonce": "n-1"});
        assert_eq!(sha256_digest(&a).unwrap(), sha256_digest(&b).unwrap());
    }

    #[test]
    fn test_digest_format() {
        let digest = sha256_digest(&json!({"amount_minor": 42})).unwrap();
        assert!(digest.starts_with("sha256:"));
        assert_eq!(digest.len(), 7 + 64);
    }
}
