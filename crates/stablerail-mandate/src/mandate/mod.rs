//! Mandate types, canonical encoding and proofs.

pub mod canonical;
pub mod signing;
pub mod types;

pub use canonical::{canonical_signing_bytes, compute_content_id};
pub use signing::{sign_mandate, verify_proof, ProofError};
pub use types::{
    CartBody, CartItem, IntentBody, Mandate, MandateBody, MandateChain, MandateDraft, MandateType,
    Money, PaymentBody, Proof, MANDATE_PAYLOAD_TYPE, PROOF_PURPOSE,
};
