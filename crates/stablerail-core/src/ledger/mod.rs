//! Append-only settlement ledger.
//!
//! One row per settled payment mandate, never updated or deleted. Appending
//! the same mandate twice returns the original row. Entries are batched into
//! [`LedgerAnchor`]s by SHA-256 Merkle root so any single entry can later be
//! proven part of an anchored batch.

mod anchor;
mod merkle;

pub use anchor::AnchorBatcher;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stablerail_chain::ChainReceipt;
use stablerail_mandate::crypto::jcs;
use thiserror::Error;
use tracing::{debug, info};

use crate::db::{configure_default, Db};
use crate::schema::LEDGER_SCHEMA;

/// Largest amount the ledger (and the policy commit log) can store.
pub const MAX_AMOUNT_MINOR: u64 = i64::MAX as u64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger storage error: {0}")]
    Storage(String),

    #[error("ledger data corrupt: {0}")]
    Corrupt(String),

    #[error("amount {amount} exceeds the storable range")]
    AmountOutOfRange { amount: u64 },
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

/// A settlement to record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLedgerEntry {
    pub mandate_id: String,
    pub from: String,
    pub to: String,
    pub amount_minor: u64,
    pub currency: String,
    pub chain: String,
    pub chain_tx_hash: String,
    pub audit_anchor: Option<String>,
}

impl NewLedgerEntry {
    pub fn from_receipt(receipt: &ChainReceipt) -> Self {
        Self {
            mandate_id: receipt.mandate_id.clone(),
            from: receipt.from.clone(),
            to: receipt.to.clone(),
            amount_minor: receipt.amount_minor,
            currency: receipt.token.clone(),
            chain: receipt.chain.clone(),
            chain_tx_hash: receipt.tx_hash.clone(),
            audit_anchor: receipt.audit_anchor.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: i64,
    pub tx_id: String,
    pub mandate_id: String,
    pub from: String,
    pub to: String,
    pub amount_minor: u64,
    pub currency: String,
    pub chain: String,
    pub chain_tx_hash: String,
    pub audit_anchor: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of [`Ledger::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    pub entry: LedgerEntry,
    /// False when the mandate was already ledgered.
    pub was_new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAnchor {
    pub anchor_id: String,
    /// `sha256:<hex>`
    pub merkle_root: String,
    pub first_seq: i64,
    pub last_seq: i64,
    pub entry_count: u64,
    pub anchored_at: DateTime<Utc>,
}

/// Path from one entry's leaf to its anchor's root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub anchor_id: String,
    pub merkle_root: String,
    pub leaf: String,
    /// Sibling hashes, bottom to top.
    pub siblings: Vec<String>,
}

/// `"sha256:" + hex(SHA256(mandate_id ":" chain ":" chain_tx_hash))`
pub fn compute_tx_id(mandate_id: &str, chain: &str, chain_tx_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(mandate_id.as_bytes());
    hasher.update(b":");
    hasher.update(chain.as_bytes());
    hasher.update(b":");
    hasher.update(chain_tx_hash.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

fn leaf_hash(entry: &LedgerEntry) -> Result<merkle::Hash, LedgerError> {
    let canonical = jcs::to_vec(entry).map_err(|e| LedgerError::Corrupt(e.to_string()))?;
    Ok(merkle::hash_leaf(&canonical))
}

fn encode_hash(hash: &merkle::Hash) -> String {
    format!("sha256:{}", hex::encode(hash))
}

fn decode_hash(s: &str) -> Result<merkle::Hash, LedgerError> {
    let hex_part = s.strip_prefix("sha256:").unwrap_or(s);
    let bytes = hex::decode(hex_part).map_err(|e| LedgerError::Corrupt(format!("bad hash {}: {}", s, e)))?;
    bytes
        .try_into()
        .map_err(|_| LedgerError::Corrupt(format!("bad hash length: {}", s)))
}

/// Check `proof` against `entry` without touching storage.
pub fn verify_inclusion(entry: &LedgerEntry, proof: &InclusionProof) -> Result<bool, LedgerError> {
    let leaf = leaf_hash(entry)?;
    if encode_hash(&leaf) != proof.leaf {
        return Ok(false);
    }
    let root = decode_hash(&proof.merkle_root)?;
    let siblings = proof
        .siblings
        .iter()
        .map(|s| decode_hash(s))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(merkle::verify(&root, &leaf, &siblings))
}

const ENTRY_COLUMNS: &str = "seq, tx_id, mandate_id, from_address, to_address, amount_minor, \
     currency, chain, chain_tx_hash, audit_anchor, created_at";

fn parse_time(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let amount: i64 = row.get(5)?;
    Ok(LedgerEntry {
        seq: row.get(0)?,
        tx_id: row.get(1)?,
        mandate_id: row.get(2)?,
        from: row.get(3)?,
        to: row.get(4)?,
        amount_minor: u64::try_from(amount).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Integer, Box::new(e))
        })?,
        currency: row.get(6)?,
        chain: row.get(7)?,
        chain_tx_hash: row.get(8)?,
        audit_anchor: row.get(9)?,
        created_at: parse_time(10, row.get(10)?)?,
    })
}

fn anchor_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerAnchor> {
    let count: i64 = row.get(4)?;
    Ok(LedgerAnchor {
        anchor_id: row.get(0)?,
        merkle_root: row.get(1)?,
        first_seq: row.get(2)?,
        last_seq: row.get(3)?,
        entry_count: count.max(0) as u64,
        anchored_at: parse_time(5, row.get(5)?)?,
    })
}

const ANCHOR_COLUMNS: &str = "anchor_id, merkle_root, first_seq, last_seq, entry_count, anchored_at";

#[derive(Clone)]
pub struct Ledger {
    db: Arc<Db>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

impl Ledger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        Ok(Self {
            db: Arc::new(Db::open(path, configure_default, LEDGER_SCHEMA)?),
        })
    }

    /// Create an in-memory ledger (for testing).
    pub fn memory() -> Result<Self, LedgerError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        Ok(Self {
            db: Arc::new(Db::single(conn, configure_default, LEDGER_SCHEMA)?),
        })
    }

    /// Append `entry`, or return the existing row for its mandate.
    pub fn record(&self, entry: &NewLedgerEntry, now: DateTime<Utc>) -> Result<LedgerRecord, LedgerError> {
        let amount = i64::try_from(entry.amount_minor).map_err(|_| LedgerError::AmountOutOfRange {
            amount: entry.amount_minor,
        })?;
        let tx_id = compute_tx_id(&entry.mandate_id, &entry.chain, &entry.chain_tx_hash);

        let (inserted, stored) = self.db.with(|conn| {
            let inserted = conn.execute(
                r#"
                INSERT INTO ledger_entries
                    (tx_id, mandate_id, from_address, to_address, amount_minor, currency,
                     chain, chain_tx_hash, audit_anchor, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(mandate_id) DO NOTHING
                "#,
                params![
                    tx_id,
                    entry.mandate_id,
                    entry.from,
                    entry.to,
                    amount,
                    entry.currency,
                    entry.chain,
                    entry.chain_tx_hash,
                    entry.audit_anchor,
                    now.to_rfc3339(),
                ],
            )?;
            let stored = get_inner(conn, &entry.mandate_id)?.ok_or_else(|| {
                LedgerError::Corrupt(format!("entry for {} missing after insert", entry.mandate_id))
            })?;
            Ok::<_, LedgerError>((inserted, stored))
        })?;

        let was_new = inserted == 1;
        if was_new {
            info!(
                mandate_id = %stored.mandate_id,
                seq = stored.seq,
                tx_hash = %stored.chain_tx_hash,
                chain = %stored.chain,
                "ledger entry appended"
            );
        } else {
            debug!(mandate_id = %stored.mandate_id, "ledger entry already present");
        }
        Ok(LedgerRecord {
            entry: stored,
            was_new,
        })
    }

    pub fn append(&self, entry: &NewLedgerEntry) -> Result<LedgerEntry, LedgerError> {
        Ok(self.record(entry, Utc::now())?.entry)
    }

    pub fn get(&self, mandate_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        self.db.with(|conn| get_inner(conn, mandate_id))
    }

    /// Up to `limit` entries with `seq > after`, in order.
    pub fn entries_after(&self, after: i64, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db.with(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM ledger_entries WHERE seq > ?1 ORDER BY seq LIMIT ?2",
                ENTRY_COLUMNS
            ))?;
            let rows = stmt.query_map(params![after, limit], entry_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn len(&self) -> Result<usize, LedgerError> {
        let n: i64 = self
            .db
            .with(|conn| conn.query_row("SELECT COUNT(*) FROM ledger_entries", [], |row| row.get(0)))?;
        Ok(n.max(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.len()? == 0)
    }

    pub fn latest_anchor(&self) -> Result<Option<LedgerAnchor>, LedgerError> {
        Ok(self.db.with(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM ledger_anchors ORDER BY last_seq DESC LIMIT 1",
                    ANCHOR_COLUMNS
                ),
                [],
                anchor_from_row,
            )
            .optional()
        })?)
    }

    /// Anchor every entry after the latest anchor. `None` when there is
    /// nothing new.
    pub fn anchor_pending(&self, now: DateTime<Utc>) -> Result<Option<LedgerAnchor>, LedgerError> {
        let result = self.db.with(|conn| {
            conn.execute("BEGIN IMMEDIATE", [])?;
            let result = anchor_inner(conn, now);
            match &result {
                Ok(Some(_)) => {
                    conn.execute("COMMIT", [])?;
                }
                _ => {
                    let _ = conn.execute("ROLLBACK", []);
                }
            }
            result
        });

        if let Ok(Some(anchor)) = &result {
            info!(
                anchor_id = %anchor.anchor_id,
                merkle_root = %anchor.merkle_root,
                first_seq = anchor.first_seq,
                last_seq = anchor.last_seq,
                "ledger batch anchored"
            );
        }
        result
    }

    /// Proof that `mandate_id`'s entry belongs to its anchor. `None` if the
    /// entry is missing or not anchored yet.
    pub fn inclusion_proof(&self, mandate_id: &str) -> Result<Option<InclusionProof>, LedgerError> {
        self.db.with(|conn| proof_inner(conn, mandate_id))
    }
}

fn proof_inner(conn: &Connection, mandate_id: &str) -> Result<Option<InclusionProof>, LedgerError> {
    let Some(entry) = get_inner(conn, mandate_id)? else {
        return Ok(None);
    };
    let anchor = conn
        .query_row(
            &format!(
                "SELECT {} FROM ledger_anchors WHERE first_seq <= ?1 AND last_seq >= ?1",
                ANCHOR_COLUMNS
            ),
            [entry.seq],
            anchor_from_row,
        )
        .optional()?;
    let Some(anchor) = anchor else {
        return Ok(None);
    };

    let batch = range_inner(conn, anchor.first_seq, anchor.last_seq)?;
    let leaves = batch.iter().map(leaf_hash).collect::<Result<Vec<_>, _>>()?;
    let index = batch
        .iter()
        .position(|e| e.seq == entry.seq)
        .ok_or_else(|| LedgerError::Corrupt(format!("entry {} missing from its batch", entry.seq)))?;
    let siblings = merkle::proof(&leaves, index)
        .ok_or_else(|| LedgerError::Corrupt("proof index out of range".to_string()))?;

    Ok(Some(InclusionProof {
        anchor_id: anchor.anchor_id,
        merkle_root: anchor.merkle_root,
        leaf: encode_hash(&leaves[index]),
        siblings: siblings.iter().map(encode_hash).collect(),
    }))
}

fn get_inner(conn: &Connection, mandate_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM ledger_entries WHERE mandate_id = ?1", ENTRY_COLUMNS),
            [mandate_id],
            entry_from_row,
        )
        .optional()?)
}

fn range_inner(conn: &Connection, first: i64, last: i64) -> Result<Vec<LedgerEntry>, LedgerError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM ledger_entries WHERE seq >= ?1 AND seq <= ?2 ORDER BY seq",
        ENTRY_COLUMNS
    ))?;
    let rows = stmt.query_map(params![first, last], entry_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn anchor_inner(conn: &Connection, now: DateTime<Utc>) -> Result<Option<LedgerAnchor>, LedgerError> {
    let anchored_through: i64 = conn.query_row(
        "SELECT COALESCE(MAX(last_seq), 0) FROM ledger_anchors",
        [],
        |row| row.get(0),
    )?;

    let batch = range_inner(conn, anchored_through + 1, i64::MAX)?;
    let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
        return Ok(None);
    };

    let leaves = batch.iter().map(leaf_hash).collect::<Result<Vec<_>, _>>()?;
    let root = merkle::root(&leaves)
        .ok_or_else(|| LedgerError::Corrupt("empty anchor batch".to_string()))?;

    let anchor = LedgerAnchor {
        anchor_id: uuid::Uuid::now_v7().to_string(),
        merkle_root: encode_hash(&root),
        first_seq: first.seq,
        last_seq: last.seq,
        entry_count: batch.len() as u64,
        anchored_at: now,
    };

    conn.execute(
        r#"
        INSERT INTO ledger_anchors
            (anchor_id, merkle_root, first_seq, last_seq, entry_count, anchored_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            anchor.anchor_id,
            anchor.merkle_root,
            anchor.first_seq,
            anchor.last_seq,
            batch.len() as i64,
            now.to_rfc3339(),
        ],
    )?;
    Ok(Some(anchor))
}
