//! Mandate data model.
//!
//! The wire form is flat: common fields, `mandate_type` as the discriminator,
//! the type-specific body fields, then `proof`.
//!
//! ```json
//! {
//!   "mandate_id": "pay-01",
//!   "mandate_type": "payment",
//!   "issuer": "did:example:agent-7",
//!   "subject": "agent-7",
//!   "purpose": "checkout",
//!   "created_at": "2026-03-01T10:00:00Z",
//!   "expires_at": "2026-03-01T10:15:00Z",
//!   "nonce": "n-7f3a",
//!   "domain": "shop.example",
//!   "amount_minor": 1050,
//!   "token": "USDC",
//!   "chain": "base",
//!   "destination": "0x…",
//!   "proof": { "algorithm": "Ed25519", "…": "…" }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload type bound into every mandate signature.
pub const MANDATE_PAYLOAD_TYPE: &str = "application/vnd.stablerail.mandate+json;v=1";

/// Default `proof.purpose`.
pub const PROOF_PURPOSE: &str = "assertionMethod";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MandateType {
    Intent,
    Cart,
    Payment,
}

impl MandateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intent => "intent",
            Self::Cart => "cart",
            Self::Payment => "payment",
        }
    }
}

impl std::fmt::Display for MandateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An amount in integer minor units of `currency`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount_minor: u64,
    pub currency: String,
}

impl Money {
    pub fn new(amount_minor: u64, currency: impl Into<String>) -> Self {
        Self {
            amount_minor,
            currency: currency.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentBody {
    pub merchant_domain: String,
    pub requested_amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub sku: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub quantity: u32,
    pub unit_price_minor: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartBody {
    pub merchant_domain: String,
    pub subtotal_minor: u64,
    pub taxes_minor: u64,
    pub currency: String,
    #[serde(default)]
    pub items: Vec<CartItem>,
}

impl CartBody {
    /// `subtotal_minor + taxes_minor`, or `None` on overflow.
    pub fn total_minor(&self) -> Option<u64> {
        self.subtotal_minor.checked_add(self.taxes_minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentBody {
    pub amount_minor: u64,
    /// Stablecoin symbol, e.g. `USDC`.
    pub token: String,
    /// Chain name as configured in the executor's chain table.
    pub chain: String,
    /// Recipient address.
    pub destination: String,
    /// Optional 32-byte hex digest appended to the transfer calldata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_hash: Option<String>,
}

/// Type-specific mandate fields, discriminated by `mandate_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mandate_type", rename_all = "lowercase")]
pub enum MandateBody {
    Intent(IntentBody),
    Cart(CartBody),
    Payment(PaymentBody),
}

impl MandateBody {
    pub fn mandate_type(&self) -> MandateType {
        match self {
            Self::Intent(_) => MandateType::Intent,
            Self::Cart(_) => MandateType::Cart,
            Self::Payment(_) => MandateType::Payment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// `Ed25519` or `ES256K`. Kept as a string so unknown algorithms survive
    /// deserialization and are rejected during verification.
    pub algorithm: String,
    pub verification_method: String,
    pub created: DateTime<Utc>,
    pub purpose: String,
    /// Base64 (standard alphabet) signature bytes.
    pub signature: String,
}

/// Signed mandate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mandate {
    pub mandate_id: String,
    pub issuer: String,
    pub subject: String,
    #[serde(default)]
    pub purpose: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub nonce: String,
    pub domain: String,
    #[serde(flatten)]
    pub body: MandateBody,
    pub proof: Proof,
}

impl Mandate {
    pub fn mandate_type(&self) -> MandateType {
        self.body.mandate_type()
    }

    pub fn intent(&self) -> Option<&IntentBody> {
        match &self.body {
            MandateBody::Intent(b) => Some(b),
            _ => None,
        }
    }

    pub fn cart(&self) -> Option<&CartBody> {
        match &self.body {
            MandateBody::Cart(b) => Some(b),
            _ => None,
        }
    }

    pub fn payment(&self) -> Option<&PaymentBody> {
        match &self.body {
            MandateBody::Payment(b) => Some(b),
            _ => None,
        }
    }

    /// `expires_at > now`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// An Intent → Cart → Payment bundle presented for settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MandateChain {
    pub intent: Mandate,
    pub cart: Mandate,
    pub payment: Mandate,
}

impl MandateChain {
    pub fn new(intent: Mandate, cart: Mandate, payment: Mandate) -> Self {
        Self {
            intent,
            cart,
            payment,
        }
    }

    /// The three mandates in chain order.
    pub fn mandates(&self) -> [&Mandate; 3] {
        [&self.intent, &self.cart, &self.payment]
    }

    /// Payment body, if the payment slot holds a payment mandate.
    pub fn payment_body(&self) -> Option<&PaymentBody> {
        self.payment.payment()
    }

    pub fn cart_body(&self) -> Option<&CartBody> {
        self.cart.cart()
    }

    pub fn intent_body(&self) -> Option<&IntentBody> {
        self.intent.intent()
    }
}

/// Unsigned mandate content, turned into a [`Mandate`] by
/// [`sign_mandate`](crate::sign_mandate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MandateDraft {
    /// Empty until assigned; [`sign_mandate`](crate::sign_mandate) fills it
    /// with the content id when left empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mandate_id: String,
    pub issuer: String,
    pub subject: String,
    #[serde(default)]
    pub purpose: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub nonce: String,
    pub domain: String,
    #[serde(flatten)]
    pub body: MandateBody,
}

impl MandateDraft {
    /// New draft valid from `created_at` until `expires_at`.
    pub fn new(
        body: MandateBody,
        issuer: impl Into<String>,
        subject: impl Into<String>,
        nonce: impl Into<String>,
        domain: impl Into<String>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            mandate_id: String::new(),
            issuer: issuer.into(),
            subject: subject.into(),
            purpose: String::new(),
            created_at,
            expires_at,
            nonce: nonce.into(),
            domain: domain.into(),
            body,
        }
    }

    pub fn with_mandate_id(mut self, mandate_id: impl Into<String>) -> Self {
        self.mandate_id = mandate_id.into();
        self
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = purpose.into();
        self
    }

    /// Assign the content-addressed id (see
    /// [`compute_content_id`](crate::compute_content_id)).
    pub fn with_content_id(mut self) -> anyhow::Result<Self> {
        self.mandate_id = crate::mandate::canonical::compute_content_id(&self)?;
        Ok(self)
    }

    pub(crate) fn into_mandate(self, proof: Proof) -> Mandate {
        Mandate {
            mandate_id: self.mandate_id,
            issuer: self.issuer,
            subject: self.subject,
            purpose: self.purpose,
            created_at: self.created_at,
            expires_at: self.expires_at,
            nonce: self.nonce,
            domain: self.domain,
            body: self.body,
            proof,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payment_json() -> serde_json::Value {
        json!({
            "mandate_id": "pay-01",
            "mandate_type": "payment",
            "issuer": "did:example:agent-7",
            "subject": "agent-7",
            "purpose": "checkout",
            "created_at": "2026-03-01T10:00:00Z",
            "expires_at": "2026-03-01T10:15:00Z",
            "nonce": "n-7f3a",
            "domain": "shop.example",
            "amount_minor": 1050,
            "token": "USDC",
            "chain": "base",
            "destination": "0x00000000000000000000000000000000000000aa",
            "proof": {
                "algorithm": "Ed25519",
                "verification_method": "did:example:agent-7#key-1",
                "created": "2026-03-01T10:00:00Z",
                "purpose": "assertionMethod",
                "signature": "AAAA"
            }
        })
    }

    #[test]
    fn test_flat_wire_form_parses() {
        let mandate: Mandate = serde_json::from_value(payment_json()).unwrap();
        assert_eq!(mandate.mandate_type(), MandateType::Payment);
        let payment = mandate.payment().unwrap();
        assert_eq!(payment.amount_minor, 1050);
        assert_eq!(payment.audit_hash, None);
        assert!(mandate.cart().is_none());
    }

    #[test]
    fn test_serialize_keeps_discriminator() {
        let mandate: Mandate = serde_json::from_value(payment_json()).unwrap();
        let value = serde_json::to_value(&mandate).unwrap();
        assert_eq!(value["mandate_type"], "payment");
        assert_eq!(value["amount_minor"], 1050);
        assert!(value.get("audit_hash").is_none());
    }

    #[test]
    fn test_negative_amount_rejected() {
        let mut value = payment_json();
        value["amount_minor"] = json!(-5);
        assert!(serde_json::from_value::<Mandate>(value).is_err());
    }

    #[test]
    fn test_fractional_amount_rejected() {
        let mut value = payment_json();
        value["amount_minor"] = json!(10.5);
        assert!(serde_json::from_value::<Mandate>(value).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut value = payment_json();
        value["mandate_type"] = json!("refund");
        assert!(serde_json::from_value::<Mandate>(value).is_err());
    }

    #[test]
    fn test_cart_total_overflow() {
        let cart = CartBody {
            merchant_domain: "shop.example".into(),
            subtotal_minor: u64::MAX,
            taxes_minor: 1,
            currency: "USD".into(),
            items: vec![],
        };
        assert_eq!(cart.total_minor(), None);

        let cart = CartBody {
            subtotal_minor: 1000,
            taxes_minor: 50,
            ..cart
        };
        assert_eq!(cart.total_minor(), Some(1050));
    }
}
