use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{ReplayCache, ReplayEntry, ReplayError, Reservation};

const STRIPES: usize = 64;

/// Process-local replay cache.
///
/// Every identifier hashes to one of a fixed set of stripe locks. A single
/// reservation takes its stripe; a batch takes all of its stripes in index
/// order before checking anything, so two batches sharing an identifier
/// cannot both see it free.
pub struct MemoryReplayCache {
    entries: DashMap<String, DateTime<Utc>>,
    stripes: Box<[Mutex<()>]>,
    hasher: RandomState,
}

impl Default for MemoryReplayCache {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
            hasher: RandomState::new(),
        }
    }
}

impl std::fmt::Debug for MemoryReplayCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReplayCache")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl MemoryReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn stripe_of(&self, mandate_id: &str) -> usize {
        (self.hasher.hash_one(mandate_id) as usize) % self.stripes.len()
    }

    fn lock_stripe(&self, index: usize) -> MutexGuard<'_, ()> {
        self.stripes[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_live(&self, mandate_id: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .get(mandate_id)
            .map(|expires_at| *expires_at > now)
            .unwrap_or(false)
    }

    /// Caller holds the stripe for `mandate_id`.
    fn reserve_locked(&self, mandate_id: &str, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.entries.entry(mandate_id.to_string()) {
            Entry::Occupied(mut held) => {
                if *held.get() > now {
                    return false;
                }
                held.insert(expires_at);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
                true
            }
        }
    }
}

impl ReplayCache for MemoryReplayCache {
    fn reserve(
        &self,
        mandate_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, ReplayError> {
        let _stripe = self.lock_stripe(self.stripe_of(mandate_id));
        Ok(self.reserve_locked(mandate_id, expires_at, now))
    }

    fn release(&self, mandate_id: &str) -> Result<(), ReplayError> {
        self.entries.remove(mandate_id);
        Ok(())
    }

    fn is_reserved(&self, mandate_id: &str, now: DateTime<Utc>) -> Result<bool, ReplayError> {
        Ok(self.is_live(mandate_id, now))
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, ReplayError> {
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        Ok(before.saturating_sub(self.entries.len()))
    }

    fn reserve_all(
        &self,
        entries: &[ReplayEntry<'_>],
        now: DateTime<Utc>,
    ) -> Result<Reservation, ReplayError> {
        let mut stripes: Vec<usize> = entries.iter().map(|e| self.stripe_of(e.mandate_id)).collect();
        stripes.sort_unstable();
        stripes.dedup();
        let _guards: Vec<_> = stripes.iter().map(|&i| self.lock_stripe(i)).collect();

        for (i, entry) in entries.iter().enumerate() {
            let repeated = entries[..i].iter().any(|e| e.mandate_id == entry.mandate_id);
            if repeated || self.is_live(entry.mandate_id, now) {
                return Ok(Reservation::Replayed {
                    mandate_id: entry.mandate_id.to_string(),
                });
            }
        }
        for entry in entries {
            self.reserve_locked(entry.mandate_id, entry.expires_at, now);
        }
        Ok(Reservation::Reserved)
    }
}
