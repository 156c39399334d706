//! Replay protection.
//!
//! A [`ReplayCache`] is the set of mandate identifiers that have already been
//! presented, each held until its mandate's own `expires_at`. Reservation is
//! an atomic check-and-insert; once a mandate has expired its identifier may
//! be reclaimed, since the verifier rejects expired mandates before reaching
//! the cache anyway.

mod memory;
mod sqlite;

pub use memory::MemoryReplayCache;
pub use sqlite::SqliteReplayCache;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplayError {
    #[error("replay store error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for ReplayError {
    fn from(e: rusqlite::Error) -> Self {
        ReplayError::Storage(e.to_string())
    }
}

/// One identifier to reserve, held until `expires_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayEntry<'a> {
    pub mandate_id: &'a str,
    pub expires_at: DateTime<Utc>,
}

impl<'a> ReplayEntry<'a> {
    pub fn new(mandate_id: &'a str, expires_at: DateTime<Utc>) -> Self {
        Self {
            mandate_id,
            expires_at,
        }
    }
}

/// Outcome of [`ReplayCache::reserve_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Every identifier was free and is now held.
    Reserved,
    /// `mandate_id` was already held; nothing from the batch stays reserved.
    Replayed { mandate_id: String },
}

impl Reservation {
    pub fn is_reserved(&self) -> bool {
        matches!(self, Reservation::Reserved)
    }
}

pub trait ReplayCache: Send + Sync {
    /// Reserve one identifier. `Ok(false)` means it is already held by a
    /// live reservation.
    fn reserve(
        &self,
        mandate_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, ReplayError>;

    /// Drop a reservation: undoes a partial batch, or a submission that
    /// failed before anything was broadcast.
    fn release(&self, mandate_id: &str) -> Result<(), ReplayError>;

    /// Whether a live reservation exists for `mandate_id`.
    fn is_reserved(&self, mandate_id: &str, now: DateTime<Utc>) -> Result<bool, ReplayError>;

    /// Remove reservations whose mandates have expired. Returns how many.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, ReplayError>;

    /// Reserve a batch all-or-nothing.
    ///
    /// The default reserves in order and releases its own reservations when
    /// a later identifier turns out to be held. Stores with transactions
    /// should override it.
    fn reserve_all(
        &self,
        entries: &[ReplayEntry<'_>],
        now: DateTime<Utc>,
    ) -> Result<Reservation, ReplayError> {
        let mut taken: Vec<&str> = Vec::with_capacity(entries.len());
        for entry in entries {
            let reserved = match self.reserve(entry.mandate_id, entry.expires_at, now) {
                Ok(reserved) => reserved,
                Err(e) => {
                    release_all(self, &taken);
                    return Err(e);
                }
            };
            if !reserved {
                release_all(self, &taken);
                return Ok(Reservation::Replayed {
                    mandate_id: entry.mandate_id.to_string(),
                });
            }
            taken.push(entry.mandate_id);
        }
        Ok(Reservation::Reserved)
    }
}

fn release_all<C: ReplayCache + ?Sized>(cache: &C, ids: &[&str]) {
    for id in ids {
        if let Err(e) = cache.release(id) {
            tracing::error!(mandate_id = %id, error = %e, "failed to release replay reservation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
    }

    fn caches() -> Vec<(&'static str, Box<dyn ReplayCache>)> {
        vec![
            ("memory", Box::new(MemoryReplayCache::new())),
            ("sqlite", Box::new(SqliteReplayCache::memory().unwrap())),
        ]
    }

    #[test]
    fn test_reserve_then_replay() {
        for (name, cache) in caches() {
            let exp = now() + Duration::minutes(5);
            assert!(cache.reserve("m-1", exp, now()).unwrap(), "{}", name);
            assert!(!cache.reserve("m-1", exp, now()).unwrap(), "{}", name);
            assert!(cache.is_reserved("m-1", now()).unwrap(), "{}", name);
        }
    }

    #[test]
    fn test_expired_entry_is_reclaimed() {
        for (name, cache) in caches() {
            let exp = now() + Duration::minutes(5);
            assert!(cache.reserve("m-1", exp, now()).unwrap(), "{}", name);

            // Still held one second before expiry, free at expiry.
            let before = exp - Duration::seconds(1);
            assert!(!cache.reserve("m-1", exp, before).unwrap(), "{}", name);
            assert!(!cache.is_reserved("m-1", exp).unwrap(), "{}", name);
            assert!(
                cache.reserve("m-1", exp + Duration::minutes(5), exp).unwrap(),
                "{}",
                name
            );
        }
    }

    #[test]
    fn test_reserve_all_is_all_or_nothing() {
        for (name, cache) in caches() {
            let exp = now() + Duration::minutes(5);
            assert!(cache.reserve("cart-1", exp, now()).unwrap());

            let batch = [
                ReplayEntry::new("intent-1", exp),
                ReplayEntry::new("cart-1", exp),
                ReplayEntry::new("payment-1", exp),
            ];
            let outcome = cache.reserve_all(&batch, now()).unwrap();
            assert_eq!(
                outcome,
                Reservation::Replayed {
                    mandate_id: "cart-1".into()
                },
                "{}",
                name
            );
            assert!(!cache.is_reserved("intent-1", now()).unwrap(), "{}", name);
            assert!(!cache.is_reserved("payment-1", now()).unwrap(), "{}", name);
            // The pre-existing reservation is untouched.
            assert!(cache.is_reserved("cart-1", now()).unwrap(), "{}", name);
        }
    }

    #[test]
    fn test_purge_expired() {
        for (name, cache) in caches() {
            cache
                .reserve("old", now() + Duration::seconds(1), now())
                .unwrap();
            cache
                .reserve("new", now() + Duration::hours(1), now())
                .unwrap();
            let purged = cache.purge_expired(now() + Duration::minutes(1)).unwrap();
            assert_eq!(purged, 1, "{}", name);
            assert!(cache.is_reserved("new", now()).unwrap(), "{}", name);
        }
    }
}
