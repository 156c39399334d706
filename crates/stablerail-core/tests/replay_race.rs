//! Multi-connection replay tests for SqliteReplayCache.
//!
//! Each test opens separate connections to one file-backed DB so the
//! guarantee comes from SQLite, not from the in-process mutex.

use chrono::{Duration, TimeZone, Utc};
use stablerail_core::{ReplayCache, ReplayEntry, Reservation, SqliteReplayCache};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::NamedTempFile;

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
}

/// Two connections racing to reserve the same id: exactly one wins.
#[test]
fn test_two_connections_reserve_one_succeeds() {
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();
    let expires = now() + Duration::minutes(15);

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let path = path.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let cache = SqliteReplayCache::open(&path).unwrap();
                barrier.wait();
                cache.reserve("payment-1", expires, now())
            })
        })
        .collect();

    let results: Vec<bool> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    assert_eq!(results.iter().filter(|won| **won).count(), 1, "{:?}", results);

    let observer = SqliteReplayCache::open(&path).unwrap();
    assert!(observer.is_reserved("payment-1", now()).unwrap());
}

/// Overlapping bundles from two connections: at most one bundle is held,
/// and the loser leaves nothing of its own behind.
#[test]
fn test_two_connections_bundle_all_or_nothing() {
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();
    let expires = now() + Duration::minutes(15);

    let bundles = [
        ["intent-a", "cart-shared", "payment-a"],
        ["intent-b", "cart-shared", "payment-b"],
    ];

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = bundles
        .iter()
        .map(|ids| {
            let path = path.clone();
            let barrier = barrier.clone();
            let ids = *ids;
            thread::spawn(move || {
                let cache = SqliteReplayCache::open(&path).unwrap();
                let entries: Vec<_> = ids.iter().map(|id| ReplayEntry::new(id, expires)).collect();
                barrier.wait();
                cache.reserve_all(&entries, now()).unwrap()
            })
        })
        .collect();
    let results: Vec<Reservation> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_reserved())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(winners.len(), 1, "{:?}", results);

    let loser = 1 - winners[0];
    assert_eq!(
        results[loser],
        Reservation::Replayed {
            mandate_id: "cart-shared".to_string()
        }
    );

    let observer = SqliteReplayCache::open(&path).unwrap();
    for id in bundles[winners[0]] {
        assert!(observer.is_reserved(id, now()).unwrap(), "{}", id);
    }
    for id in [bundles[loser][0], bundles[loser][2]] {
        assert!(!observer.is_reserved(id, now()).unwrap(), "{}", id);
    }
}

#[test]
fn test_reservation_survives_reopen_until_expiry() {
    let tmp = NamedTempFile::new().unwrap();
    let expires = now() + Duration::minutes(15);
    {
        let cache = SqliteReplayCache::open(tmp.path()).unwrap();
        assert!(cache.reserve("payment-1", expires, now()).unwrap());
    }

    let reopened = SqliteReplayCache::open(tmp.path()).unwrap();
    assert!(!reopened.reserve("payment-1", expires, now() + Duration::minutes(14)).unwrap());
    assert!(reopened.reserve("payment-1", expires + Duration::hours(1), expires).unwrap());
}
