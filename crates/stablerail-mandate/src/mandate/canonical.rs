//! Canonical bytes for hashing and signing.
//!
//! ```text
//! signing_input = PAE(MANDATE_PAYLOAD_TYPE, JCS(mandate without proof.signature))
//! content_id    = "sha256:" + hex(SHA256(JCS(draft without mandate_id)))
//! ```

use crate::crypto::jcs;
use crate::mandate::types::{Mandate, MandateDraft, MANDATE_PAYLOAD_TYPE};
use anyhow::{Context as _, Result};
use sha2::{Digest, Sha256};

/// Bytes covered by `proof.signature`.
///
/// Every other field of the mandate, including the rest of `proof`, is
/// bound into the signature.
pub fn canonical_signing_bytes(mandate: &Mandate) -> Result<Vec<u8>> {
    let mut value = serde_json::to_value(mandate).context("failed to serialize mandate")?;
    if let Some(proof) = value.get_mut("proof").and_then(|p| p.as_object_mut()) {
        proof.remove("signature");
    }
    let canonical = jcs::to_vec(&value).context("failed to canonicalize mandate for signing")?;
    Ok(build_pae(MANDATE_PAYLOAD_TYPE, &canonical))
}

/// Content-addressed id for a draft, independent of any id it may already
/// carry.
pub fn compute_content_id(draft: &MandateDraft) -> Result<String> {
    let mut value = serde_json::to_value(draft).context("failed to serialize mandate draft")?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("mandate_id");
    }
    let canonical = jcs::to_vec(&value).context("failed to canonicalize mandate content")?;
    Ok(format!("sha256:{}", hex::encode(Sha256::digest(&canonical))))
}

/// DSSE pre-authentication encoding.
///
/// ```text
/// PAE(type, payload) = "DSSEv1" SP LEN(type) SP type SP LEN(payload) SP payload
/// ```
pub(crate) fn build_pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut pae = Vec::with_capacity(payload_type.len() + payload.len() + 32);
    pae.extend_from_slice(b"DSSEv1 ");
    pae.extend_from_slice(payload_type.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload_type.as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload);
    pae
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mandate::types::{IntentBody, MandateBody, Money};
    use chrono::{TimeZone, Utc};

    fn draft() -> MandateDraft {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        MandateDraft::new(
            MandateBody::Intent(IntentBody {
                merchant_domain: "shop.example".into(),
                requested_amount: Money::new(1000, "USD"),
            }),
            "did:example:alice",
            "alice",
            "n-1",
            "shop.example",
            t,
            t + chrono::Duration::minutes(15),
        )
    }

    #[test]
    fn test_pae_layout() {
        let pae = build_pae("t/x", b"{}");
        assert_eq!(pae, b"DSSEv1 3 t/x 2 {}");
    }

    #[test]
    fn test_content_id_ignores_assigned_id() {
        let a = compute_content_id(&draft()).unwrap();
        let b = compute_content_id(&draft().with_mandate_id("intent-1")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 71);
    }

    #[test]
    fn test_content_id_changes_with_content() {
        let a = compute_content_id(&draft()).unwrap();
        let b = compute_content_id(&draft().with_purpose("gift")).unwrap();
        assert_ne!(a, b);
    }
}
