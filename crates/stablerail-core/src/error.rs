//! Infrastructure errors of the settlement pipeline.
//!
//! Protocol and policy rejections are not errors; they come back as
//! [`SettlementOutcome`](crate::pipeline::SettlementOutcome) values.

use stablerail_chain::ChainError;
use thiserror::Error;

use crate::ledger::LedgerError;
use crate::policy::PolicyStoreError;
use crate::replay::ReplayError;
use crate::verifier::VerifierError;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error(transparent)]
    Verifier(#[from] VerifierError),

    #[error(transparent)]
    PolicyStore(#[from] PolicyStoreError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error("configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("background task failed: {0}")]
    Task(String),
}

impl SettlementError {
    /// Whether retrying the same submission may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Chain(e) => e.is_retryable(),
            Self::Ledger(e) => e.is_retryable(),
            Self::PolicyStore(PolicyStoreError::VersionConflict { .. }) => true,
            Self::Replay(_) | Self::PolicyStore(PolicyStoreError::Storage(_)) => true,
            _ => false,
        }
    }
}

pub type SettlementResult<T> = Result<T, SettlementError>;
