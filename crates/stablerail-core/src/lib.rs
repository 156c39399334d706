//! StableRail settlement core.
//!
//! Turns a signed Intent → Cart → Payment mandate chain into an authorized,
//! policy-checked, on-chain payment, exactly once:
//!
//! 1. [`MandateVerifier`] checks structure, expiry, binding, amount and
//!    signatures, then consumes the chain in a [`ReplayCache`].
//! 2. The spending policy engine ([`policy::evaluate`],
//!    [`PolicyStore::commit`]) decides whether the agent may spend.
//! 3. [`stablerail_chain::ChainExecutor`] signs and broadcasts the transfer.
//! 4. Confirmed payments land in the append-only [`Ledger`], batched into
//!    Merkle anchors.
//!
//! [`SettlementPipeline`] wires the stages together.

pub mod config;
mod db;
pub mod error;
pub mod events;
pub mod keys;
pub mod ledger;
pub mod pipeline;
pub mod policy;
pub mod replay;
pub mod schema;
pub mod verifier;

pub use config::{AnchoringConfig, DispatchDefaults, SettlementConfig, StorageConfig};
pub use error::{SettlementError, SettlementResult};
pub use events::{ChannelNotifier, EventType, Notifier, SettlementEvent, TracingNotifier};
pub use keys::{KeyResolver, KeyResolverError, ResolvedKey, StaticKeyResolver};
pub use ledger::{
    compute_tx_id, verify_inclusion, AnchorBatcher, InclusionProof, Ledger, LedgerAnchor,
    LedgerEntry, LedgerError, LedgerRecord, NewLedgerEntry, MAX_AMOUNT_MINOR,
};
pub use pipeline::{SettlementOutcome, SettlementPipeline, SettlementRequest};
pub use policy::{
    CommitOutcome, Decision, MerchantMode, MerchantRule, PolicyRejection, PolicyStore,
    PolicyStoreError, RuleTarget, RuleType, Scope, SpendRequest, SpendingPolicy,
    TimeWindowLimit, TrustLevel, WindowType,
};
pub use replay::{
    MemoryReplayCache, ReplayCache, ReplayEntry, ReplayError, Reservation, SqliteReplayCache,
};
pub use verifier::{MandateVerifier, RejectReason, VerificationResult, VerifierError};
