use super::super::*;
use crate::keys::StaticKeyResolver;
use crate::replay::{MemoryReplayCache, ReplayCache, ReplayEntry, ReplayError};
use chrono::{DateTime, Duration, TimeZone, Utc};
use stablerail_mandate::{
    sign_mandate, CartBody, CartItem, IntentBody, Mandate, MandateBody, MandateChain,
    MandateDraft, MandateSigningKey, Money, PaymentBody,
};
use std::sync::Arc;

const ALICE: &str = "did:example:alice";
const ALICE_KEY: &str = "did:example:alice#key-1";
const SHOP: &str = "did:web:shop.example";
const SHOP_KEY: &str = "did:web:shop.example#key-1";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
}

fn now() -> DateTime<Utc> {
    t0() + Duration::minutes(1)
}

fn user_key() -> MandateSigningKey {
    MandateSigningKey::ed25519_from_seed([11u8; 32])
}

fn merchant_key() -> MandateSigningKey {
    MandateSigningKey::secp256k1_from_bytes(&[22u8; 32]).unwrap()
}

fn resolver() -> StaticKeyResolver {
    StaticKeyResolver::new()
        .with_key(ALICE, ALICE_KEY, user_key().public_key())
        .with_key(SHOP, SHOP_KEY, merchant_key().public_key())
}

/// Knobs for one chain; [`build`](Self::build) signs with the right keys.
struct ChainSpec {
    suffix: &'static str,
    intent_domain: &'static str,
    cart_merchant: &'static str,
    payment_domain: &'static str,
    payment_nonce: &'static str,
    subtotal: u64,
    taxes: u64,
    amount: u64,
    lifetime: Duration,
}

impl Default for ChainSpec {
    fn default() -> Self {
        Self {
            suffix: "1",
            intent_domain: "shop.example",
            cart_merchant: "shop.example",
            payment_domain: "shop.example",
            payment_nonce: "n-7f3a",
            subtotal: 1000,
            taxes: 50,
            amount: 1050,
            lifetime: Duration::minutes(15),
        }
    }
}

impl ChainSpec {
    fn draft(
        &self,
        kind: &str,
        domain: &str,
        nonce: &str,
        body: MandateBody,
        issuer: &str,
    ) -> MandateDraft {
        let expires_at = t0() + self.lifetime;
        MandateDraft::new(body, issuer, "agent-7", nonce, domain, t0(), expires_at)
            .with_mandate_id(format!("{}-{}", kind, self.suffix))
    }

    fn build(&self) -> MandateChain {
        let intent = sign_mandate(
            self.draft(
                "intent",
                self.intent_domain,
                "n-7f3a",
                MandateBody::Intent(IntentBody {
                    merchant_domain: self.cart_merchant.into(),
                    requested_amount: Money::new(self.amount, "USD"),
                }),
                ALICE,
            ),
            &user_key(),
            ALICE_KEY,
        )
        .unwrap();

        let cart = sign_mandate(
            self.draft(
                "cart",
                self.cart_merchant,
                "n-7f3a",
                MandateBody::Cart(CartBody {
                    merchant_domain: self.cart_merchant.into(),
                    subtotal_minor: self.subtotal,
                    taxes_minor: self.taxes,
                    currency: "USD".into(),
                    items: vec![CartItem {
                        sku: "TEA-01".into(),
                        description: Some("Sencha 100g".into()),
                        quantity: 2,
                        unit_price_minor: self.subtotal / 2,
                    }],
                }),
                SHOP,
            ),
            &merchant_key(),
            SHOP_KEY,
        )
        .unwrap();

        let payment = sign_mandate(
            self.draft(
                "payment",
                self.payment_domain,
                self.payment_nonce,
                MandateBody::Payment(PaymentBody {
                    amount_minor: self.amount,
                    token: "USDC".into(),
                    chain: "base".into(),
                    destination: "0x00000000000000000000000000000000000000aa".into(),
                    audit_hash: None,
                }),
                ALICE,
            ),
            &user_key(),
            ALICE_KEY,
        )
        .unwrap();

        MandateChain::new(intent, cart, payment)
    }
}

fn verifier() -> (MandateVerifier, Arc<MemoryReplayCache>) {
    let cache = Arc::new(MemoryReplayCache::new());
    let verifier = MandateVerifier::new(Arc::new(resolver()), cache.clone());
    (verifier, cache)
}

async fn reason_for(chain: &MandateChain) -> Option<RejectReason> {
    let (verifier, _) = verifier();
    verifier.verify_chain_at(chain, now()).await.unwrap().reason
}

fn resign(mandate: &mut Mandate, key: &MandateSigningKey) {
    let draft = MandateDraft {
        mandate_id: mandate.mandate_id.clone(),
        issuer: mandate.issuer.clone(),
        subject: mandate.subject.clone(),
        purpose: mandate.purpose.clone(),
        created_at: mandate.created_at,
        expires_at: mandate.expires_at,
        nonce: mandate.nonce.clone(),
        domain: mandate.domain.clone(),
        body: mandate.body.clone(),
    };
    let vm = mandate.proof.verification_method.clone();
    *mandate = sign_mandate(draft, key, vm).unwrap();
}

#[tokio::test]
async fn test_valid_chain_accepted() {
    let (verifier, cache) = verifier();
    let chain = ChainSpec::default().build();

    let result = verifier.verify_chain_at(&chain, now()).await.unwrap();
    assert_eq!(result, VerificationResult::accept());
    for mandate in chain.mandates() {
        assert!(cache.is_reserved(&mandate.mandate_id, now()).unwrap());
    }
}

#[tokio::test]
async fn test_second_presentation_is_replay() {
    let (verifier, _) = verifier();
    let chain = ChainSpec::default().build();

    assert!(verifier.verify_chain_at(&chain, now()).await.unwrap().accepted);
    let again = verifier
        .verify_chain_at(&chain, now() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(again.reason, Some(RejectReason::ReplayDetected));
}

#[tokio::test]
async fn test_replay_of_one_id_reserves_nothing_else() {
    let (verifier, cache) = verifier();
    let chain = ChainSpec::default().build();
    cache
        .reserve_all(
            &[ReplayEntry::new("payment-1", t0() + Duration::hours(1))],
            now(),
        )
        .unwrap();

    let result = verifier.verify_chain_at(&chain, now()).await.unwrap();
    assert_eq!(result.reason, Some(RejectReason::ReplayDetected));
    assert!(!cache.is_reserved("intent-1", now()).unwrap());
    assert!(!cache.is_reserved("cart-1", now()).unwrap());
}

#[tokio::test]
async fn test_expiry_is_strict() {
    let (verifier, _) = verifier();
    let chain = ChainSpec::default().build();
    let at_expiry = t0() + Duration::minutes(15);

    let result = verifier.verify_chain_at(&chain, at_expiry).await.unwrap();
    assert_eq!(result.reason, Some(RejectReason::MandateExpired));

    let just_before = at_expiry - Duration::seconds(1);
    assert!(verifier.verify_chain_at(&chain, just_before).await.unwrap().accepted);
}

#[tokio::test]
async fn test_domain_mismatch() {
    let chain = ChainSpec {
        payment_domain: "evil.example",
        ..Default::default()
    }
    .build();
    assert_eq!(reason_for(&chain).await, Some(RejectReason::DomainMismatch));

    let chain = ChainSpec {
        intent_domain: "other.example",
        ..Default::default()
    }
    .build();
    assert_eq!(reason_for(&chain).await, Some(RejectReason::DomainMismatch));
}

#[tokio::test]
async fn test_nonce_mismatch_is_domain_mismatch() {
    let chain = ChainSpec {
        payment_nonce: "n-other",
        ..Default::default()
    }
    .build();
    assert_eq!(reason_for(&chain).await, Some(RejectReason::DomainMismatch));
}

#[tokio::test]
async fn test_amount_exceeds_cart() {
    // subtotal 1000 + taxes 50 < payment 1100
    let chain = ChainSpec {
        amount: 1100,
        ..Default::default()
    }
    .build();
    assert_eq!(reason_for(&chain).await, Some(RejectReason::AmountExceedsCart));
}

#[tokio::test]
async fn test_amount_checked_before_signatures() {
    let mut chain = ChainSpec {
        amount: 1100,
        ..Default::default()
    }
    .build();
    chain.payment.proof.signature = "AAAA".into();
    chain.cart.proof.signature = "!!not base64!!".into();
    assert_eq!(reason_for(&chain).await, Some(RejectReason::AmountExceedsCart));
}

#[tokio::test]
async fn test_overflowing_cart_is_malformed() {
    let mut chain = ChainSpec::default().build();
    if let MandateBody::Cart(cart) = &mut chain.cart.body {
        cart.subtotal_minor = u64::MAX;
        cart.taxes_minor = 1;
    }
    resign(&mut chain.cart, &merchant_key());
    assert_eq!(reason_for(&chain).await, Some(RejectReason::MalformedMandate));
}

#[tokio::test]
async fn test_unstorable_amount_is_malformed() {
    let chain = ChainSpec {
        subtotal: u64::MAX,
        taxes: 0,
        amount: u64::MAX,
        ..Default::default()
    }
    .build();
    assert_eq!(reason_for(&chain).await, Some(RejectReason::MalformedMandate));

    let largest = ChainSpec {
        subtotal: i64::MAX as u64,
        taxes: 0,
        amount: i64::MAX as u64,
        ..Default::default()
    }
    .build();
    assert_eq!(reason_for(&largest).await, None);
}

#[tokio::test]
async fn test_structural_failures_are_malformed() {
    let base = ChainSpec::default().build();

    let mut swapped = base.clone();
    std::mem::swap(&mut swapped.intent, &mut swapped.cart);
    assert_eq!(reason_for(&swapped).await, Some(RejectReason::MalformedMandate));

    let mut empty_nonce = base.clone();
    empty_nonce.intent.nonce.clear();
    assert_eq!(
        reason_for(&empty_nonce).await,
        Some(RejectReason::MalformedMandate)
    );

    let mut duplicate_id = base.clone();
    duplicate_id.payment.mandate_id = duplicate_id.cart.mandate_id.clone();
    assert_eq!(
        reason_for(&duplicate_id).await,
        Some(RejectReason::MalformedMandate)
    );

    let mut inverted = base.clone();
    inverted.cart.created_at = inverted.cart.expires_at + Duration::seconds(1);
    assert_eq!(reason_for(&inverted).await, Some(RejectReason::MalformedMandate));

    let mut no_destination = base;
    if let MandateBody::Payment(p) = &mut no_destination.payment.body {
        p.destination = "  ".into();
    }
    assert_eq!(
        reason_for(&no_destination).await,
        Some(RejectReason::MalformedMandate)
    );
}

#[tokio::test]
async fn test_unknown_issuer() {
    let chain = ChainSpec::default().build();
    let verifier = MandateVerifier::new(
        Arc::new(StaticKeyResolver::new().with_key(ALICE, ALICE_KEY, user_key().public_key())),
        Arc::new(MemoryReplayCache::new()),
    );
    let result = verifier.verify_chain_at(&chain, now()).await.unwrap();
    assert_eq!(result.reason, Some(RejectReason::UnknownIssuer));
}

#[tokio::test]
async fn test_tampered_body_is_invalid() {
    let mut chain = ChainSpec::default().build();
    if let MandateBody::Cart(cart) = &mut chain.cart.body {
        cart.items[0].description = Some("Gyokuro 100g".into());
    }
    assert_eq!(reason_for(&chain).await, Some(RejectReason::SignatureInvalid));
}

#[tokio::test]
async fn test_malformed_signatures() {
    let base = ChainSpec::default().build();

    let mut not_base64 = base.clone();
    not_base64.intent.proof.signature = "%%%".into();
    assert_eq!(
        reason_for(&not_base64).await,
        Some(RejectReason::SignatureMalformed)
    );

    let mut short = base.clone();
    short.intent.proof.signature = "AAAA".into();
    assert_eq!(reason_for(&short).await, Some(RejectReason::SignatureMalformed));

    let mut unknown_alg = base;
    unknown_alg.cart.proof.algorithm = "RS256".into();
    assert_eq!(
        reason_for(&unknown_alg).await,
        Some(RejectReason::SignatureMalformed)
    );
}

#[tokio::test]
async fn test_algorithm_mismatch_is_invalid() {
    let mut chain = ChainSpec::default().build();
    chain.intent.proof.algorithm = "ES256K".into();
    assert_eq!(reason_for(&chain).await, Some(RejectReason::SignatureInvalid));
}

#[tokio::test]
async fn test_verification_method_mismatch_is_invalid() {
    let mut chain = ChainSpec::default().build();
    chain.payment.proof.verification_method = "did:example:alice#key-2".into();
    resign(&mut chain.payment, &user_key());
    assert_eq!(reason_for(&chain).await, Some(RejectReason::SignatureInvalid));
}

#[tokio::test]
async fn test_rejection_leaves_no_reservation() {
    let (verifier, cache) = verifier();
    let mut chain = ChainSpec::default().build();
    chain.payment.proof.signature = chain.intent.proof.signature.clone();

    let result = verifier.verify_chain_at(&chain, now()).await.unwrap();
    assert_eq!(result.reason, Some(RejectReason::SignatureInvalid));
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_verify_json_roundtrip_and_decode_failures() {
    let (verifier, _) = verifier();
    let chain = ChainSpec {
        suffix: "json",
        ..Default::default()
    }
    .build();
    let bytes = serde_json::to_vec_pretty(&chain).unwrap();
    assert!(verifier.verify_json_at(&bytes, now()).await.unwrap().accepted);

    let mut value = serde_json::to_value(&chain).unwrap();
    value["payment"]["amount_minor"] = serde_json::json!(-5);
    let negative = serde_json::to_vec(&value).unwrap();

    let mut value = serde_json::to_value(&chain).unwrap();
    value["cart"]["expires_at"] = serde_json::json!("next tuesday");
    let bad_time = serde_json::to_vec(&value).unwrap();

    let mut value = serde_json::to_value(&chain).unwrap();
    value["intent"].as_object_mut().unwrap().remove("issuer");
    let missing = serde_json::to_vec(&value).unwrap();

    for bytes in [negative, bad_time, missing, b"{".to_vec()] {
        let result = verifier.verify_json_at(&bytes, now()).await.unwrap();
        assert_eq!(result.reason, Some(RejectReason::MalformedMandate));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_presentations_accept_once() {
    let (verifier, _) = verifier();
    let chain = Arc::new(ChainSpec::default().build());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let verifier = verifier.clone();
            let chain = chain.clone();
            tokio::spawn(async move { verifier.verify_chain_at(&chain, now()).await.unwrap() })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        let result = handle.await.unwrap();
        if result.accepted {
            accepted += 1;
        } else {
            assert_eq!(result.reason, Some(RejectReason::ReplayDetected));
        }
    }
    assert_eq!(accepted, 1);
}

struct UnavailableReplay;

impl ReplayCache for UnavailableReplay {
    fn reserve(
        &self,
        _mandate_id: &str,
        _expires_at: DateTime<Utc>,
        _now: DateTime<Utc>,
    ) -> Result<bool, ReplayError> {
        Err(ReplayError::Storage("database is locked".into()))
    }

    fn release(&self, _mandate_id: &str) -> Result<(), ReplayError> {
        Ok(())
    }

    fn is_reserved(&self, _mandate_id: &str, _now: DateTime<Utc>) -> Result<bool, ReplayError> {
        Ok(false)
    }

    fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize, ReplayError> {
        Ok(0)
    }
}

#[tokio::test]
async fn test_replay_store_failure_is_error() {
    let verifier = MandateVerifier::new(Arc::new(resolver()), Arc::new(UnavailableReplay));
    let chain = ChainSpec::default().build();
    let err = verifier.verify_chain_at(&chain, now()).await.unwrap_err();
    assert!(matches!(err, VerifierError::Replay(_)));
}

#[test]
fn test_reject_reason_wire_names() {
    assert_eq!(
        serde_json::to_value(RejectReason::AmountExceedsCart).unwrap(),
        serde_json::json!("amount_exceeds_cart")
    );
    let json = serde_json::to_value(VerificationResult::reject(RejectReason::ReplayDetected)).unwrap();
    assert_eq!(
        json,
        serde_json::json!({"accepted": false, "reason": "replay_detected"})
    );
    assert_eq!(
        serde_json::to_value(VerificationResult::accept()).unwrap(),
        serde_json::json!({"accepted": true})
    );
}
