use super::super::{MandateVerifier, RejectReason, VerifierError};
use super::Rejection;
use crate::replay::{ReplayEntry, ReplayError, Reservation};
use chrono::{DateTime, Utc};
use stablerail_mandate::MandateChain;
use std::sync::Arc;

/// Reserve all three ids, each until its own `expires_at`. The cache may
/// block on storage, so it runs on the blocking pool.
pub(crate) async fn reserve_chain_impl(
    verifier: &MandateVerifier,
    chain: &MandateChain,
    now: DateTime<Utc>,
) -> Result<Result<(), Rejection>, VerifierError> {
    let ids = chain
        .mandates()
        .map(|m| (m.mandate_id.clone(), m.expires_at));
    let cache = Arc::clone(&verifier.replay);

    let reservation = tokio::task::spawn_blocking(move || {
        let entries = ids
            .iter()
            .map(|(id, expires_at)| ReplayEntry::new(id, *expires_at))
            .collect::<Vec<_>>();
        cache.reserve_all(&entries, now)
    })
    .await
    .map_err(|e| ReplayError::Storage(format!("replay task failed: {}", e)))??;

    match reservation {
        Reservation::Reserved => Ok(Ok(())),
        Reservation::Replayed { mandate_id } => Ok(Err(Rejection::new(
            RejectReason::ReplayDetected,
            format!("mandate {} already presented", mandate_id),
        ))),
    }
}
