//! Signed mandates for agent-to-merchant stablecoin payments.
//!
//! A payment is authorized by a chain of three mandates, each an immutable,
//! time-bounded assertion signed by its issuer:
//!
//! | Type | Asserts | Type-specific fields |
//! |------|---------|----------------------|
//! | `intent` | The principal wants to buy from a merchant | `merchant_domain`, `requested_amount` |
//! | `cart` | The merchant's priced basket | `merchant_domain`, `subtotal_minor`, `taxes_minor`, `items` |
//! | `payment` | Authorization to move funds on-chain | `amount_minor`, `token`, `chain`, `destination`, `audit_hash` |
//!
//! All amounts are integer minor units. Signatures cover the RFC 8785 (JCS)
//! canonical form of the mandate with `proof.signature` removed, wrapped in
//! a DSSE pre-authentication encoding.
//!
//! ```rust
//! use stablerail_mandate::{MandateSigningKey, ProofAlgorithm};
//!
//! let key = MandateSigningKey::ed25519_from_seed([7u8; 32]);
//! assert_eq!(key.algorithm(), ProofAlgorithm::Ed25519);
//! ```

pub mod crypto;
pub mod mandate;

pub use crypto::keys::{compute_key_id, MandateSigningKey, ProofAlgorithm, PublicKey};
pub use mandate::{
    canonical_signing_bytes, compute_content_id, sign_mandate, verify_proof, CartBody, CartItem,
    IntentBody, Mandate, MandateBody, MandateChain, MandateDraft, MandateType, Money, PaymentBody,
    Proof, ProofError, MANDATE_PAYLOAD_TYPE,
};
