use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{ReplayCache, ReplayEntry, ReplayError, Reservation};
use crate::db::{configure_default, Db};
use crate::schema::REPLAY_SCHEMA;

/// Durable replay cache.
///
/// Several processes may share one database file; each reservation is a
/// conditional upsert, and [`reserve_all`](ReplayCache::reserve_all) runs in
/// one `BEGIN IMMEDIATE` transaction.
#[derive(Clone)]
pub struct SqliteReplayCache {
    db: Arc<Db>,
}

impl std::fmt::Debug for SqliteReplayCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteReplayCache").finish_non_exhaustive()
    }
}

impl SqliteReplayCache {
    /// Open a file-backed cache.
    pub fn open(path: &Path) -> Result<Self, ReplayError> {
        Ok(Self {
            db: Arc::new(Db::open(path, configure_default, REPLAY_SCHEMA)?),
        })
    }

    /// Create an in-memory cache (for testing).
    pub fn memory() -> Result<Self, ReplayError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, ReplayError> {
        Ok(Self {
            db: Arc::new(Db::single(conn, configure_default, REPLAY_SCHEMA)?),
        })
    }

    /// Stored expiry for `mandate_id`, live or not (for testing/debugging).
    pub fn expires_at(&self, mandate_id: &str) -> Result<Option<DateTime<Utc>>, ReplayError> {
        let ms: Option<i64> = self.db.with(|conn| {
            conn.query_row(
                "SELECT expires_at_ms FROM replay_reservations WHERE mandate_id = ?1",
                [mandate_id],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(ms.and_then(DateTime::from_timestamp_millis))
    }
}

fn reserve_inner(
    conn: &Connection,
    mandate_id: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool, ReplayError> {
    // Insert, or take over a row whose mandate has expired.
    let changed = conn.execute(
        r#"
        INSERT INTO replay_reservations (mandate_id, expires_at_ms, reserved_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(mandate_id) DO UPDATE SET
            expires_at_ms = excluded.expires_at_ms,
            reserved_at = excluded.reserved_at
        WHERE replay_reservations.expires_at_ms <= ?4
        "#,
        params![
            mandate_id,
            expires_at.timestamp_millis(),
            now.to_rfc3339(),
            now.timestamp_millis(),
        ],
    )?;
    Ok(changed == 1)
}

impl ReplayCache for SqliteReplayCache {
    fn reserve(
        &self,
        mandate_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, ReplayError> {
        self.db
            .with(|conn| reserve_inner(conn, mandate_id, expires_at, now))
    }

    fn release(&self, mandate_id: &str) -> Result<(), ReplayError> {
        self.db.with(|conn| {
            conn.execute(
                "DELETE FROM replay_reservations WHERE mandate_id = ?1",
                [mandate_id],
            )
        })?;
        Ok(())
    }

    fn is_reserved(&self, mandate_id: &str, now: DateTime<Utc>) -> Result<bool, ReplayError> {
        let live: i64 = self.db.with(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM replay_reservations WHERE mandate_id = ?1 AND expires_at_ms > ?2",
                params![mandate_id, now.timestamp_millis()],
                |row| row.get(0),
            )
        })?;
        Ok(live > 0)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, ReplayError> {
        let removed = self.db.with(|conn| {
            conn.execute(
                "DELETE FROM replay_reservations WHERE expires_at_ms <= ?1",
                [now.timestamp_millis()],
            )
        })?;
        Ok(removed)
    }

    fn reserve_all(
        &self,
        entries: &[ReplayEntry<'_>],
        now: DateTime<Utc>,
    ) -> Result<Reservation, ReplayError> {
        self.db.with(|conn| reserve_all_inner(conn, entries, now))
    }
}

fn reserve_all_inner(
    conn: &Connection,
    entries: &[ReplayEntry<'_>],
    now: DateTime<Utc>,
) -> Result<Reservation, ReplayError> {
    // BEGIN IMMEDIATE acquires write lock immediately
    conn.execute("BEGIN IMMEDIATE", [])?;

    let mut outcome = Ok(Reservation::Reserved);
    for entry in entries {
        match reserve_inner(conn, entry.mandate_id, entry.expires_at, now) {
            Ok(true) => {}
            Ok(false) => {
                outcome = Ok(Reservation::Replayed {
                    mandate_id: entry.mandate_id.to_string(),
                });
                break;
            }
            Err(e) => {
                outcome = Err(e);
                break;
            }
        }
    }

    match &outcome {
        Ok(Reservation::Reserved) => {
            conn.execute("COMMIT", [])?;
        }
        Ok(Reservation::Replayed { mandate_id }) => {
            debug!(%mandate_id, "replay batch rolled back");
            let _ = conn.execute("ROLLBACK", []);
        }
        Err(_) => {
            let _ = conn.execute("ROLLBACK", []);
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_store_bootstraps_schema() {
        let cache = SqliteReplayCache::memory().unwrap();
        let tables: i64 = cache
            .db
            .with(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='replay_reservations'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(tables, 1);
    }

    #[test]
    fn test_reclaim_updates_expiry() {
        let cache = SqliteReplayCache::memory().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let first = now + Duration::minutes(1);
        let second = now + Duration::minutes(30);

        assert!(cache.reserve("m-1", first, now).unwrap());
        assert!(cache.reserve("m-1", second, first).unwrap());
        assert_eq!(cache.expires_at("m-1").unwrap(), Some(second));
    }

    #[test]
    fn test_file_cache_batches_race_across_connections() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let cache = SqliteReplayCache::open(tmp.path()).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let exp = now + Duration::minutes(5);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    let own = format!("intent-{}", i);
                    let batch = [ReplayEntry::new(&own, exp), ReplayEntry::new("payment-shared", exp)];
                    cache.reserve_all(&batch, now).unwrap()
                })
            })
            .collect();
        let won = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Reservation::is_reserved)
            .count();
        assert_eq!(won, 1);
        assert!(cache.is_reserved("payment-shared", now).unwrap());
    }
}
