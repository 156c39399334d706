//! SQLite-backed policy storage.
//!
//! Each agent's policy is one row (JSON + `version`). A commit is one
//! `BEGIN IMMEDIATE` transaction that:
//! - returns `AlreadyCommitted` if the mandate is in `policy_commits`
//! - re-evaluates against the stored counters
//! - writes the updated policy with a compare-and-swap on `version`
//! - records the mandate in `policy_commits`
//!
//! [`PolicyStore::revert`] undoes a commit whose payment never left the
//! process, in the same kind of transaction.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::engine::{commit_spend, revert_spend};
use super::{CommitOutcome, Scope, SpendRequest, SpendingPolicy};
use crate::db::{configure_default, Db};
use crate::schema::POLICY_SCHEMA;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyStoreError {
    #[error("no policy for agent {agent_id}")]
    PolicyNotFound { agent_id: String },

    #[error("policy for agent {agent_id} changed concurrently")]
    VersionConflict { agent_id: String },

    #[error("stored policy for agent {agent_id} is corrupt: {message}")]
    Corrupt { agent_id: String, message: String },

    #[error("amount {amount} exceeds the storable range")]
    AmountOutOfRange { amount: u64 },

    #[error("policy store error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for PolicyStoreError {
    fn from(e: rusqlite::Error) -> Self {
        PolicyStoreError::Storage(e.to_string())
    }
}

/// A stored policy and its row version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedPolicy {
    pub policy: SpendingPolicy,
    pub version: i64,
}

#[derive(Clone)]
pub struct PolicyStore {
    db: Arc<Db>,
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore").finish_non_exhaustive()
    }
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    configure_default(conn)
}

impl PolicyStore {
    /// Open a file-backed store.
    pub fn open(path: &Path) -> Result<Self, PolicyStoreError> {
        Ok(Self {
            db: Arc::new(Db::open(path, configure, POLICY_SCHEMA)?),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn memory() -> Result<Self, PolicyStoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, PolicyStoreError> {
        Ok(Self {
            db: Arc::new(Db::single(conn, configure, POLICY_SCHEMA)?),
        })
    }

    /// Insert or replace an agent's policy. Returns the new row version.
    pub fn put(&self, policy: &SpendingPolicy) -> Result<i64, PolicyStoreError> {
        let json = encode(policy)?;
        let version: i64 = self.db.with(|conn| {
            conn.query_row(
                r#"
                INSERT INTO policies (agent_id, policy_json, version, updated_at)
                VALUES (?1, ?2, 1, ?3)
                ON CONFLICT(agent_id) DO UPDATE SET
                    policy_json = excluded.policy_json,
                    version = policies.version + 1,
                    updated_at = excluded.updated_at
                RETURNING version
                "#,
                params![policy.agent_id, json, Utc::now().to_rfc3339()],
                |row| row.get(0),
            )
        })?;
        debug!(agent_id = %policy.agent_id, version, "policy stored");
        Ok(version)
    }

    pub fn get(&self, agent_id: &str) -> Result<Option<SpendingPolicy>, PolicyStoreError> {
        Ok(self.get_versioned(agent_id)?.map(|v| v.policy))
    }

    pub fn get_versioned(&self, agent_id: &str) -> Result<Option<VersionedPolicy>, PolicyStoreError> {
        self.db.with(|conn| load(conn, agent_id))
    }

    /// Whether `mandate_id` has been committed against any policy.
    pub fn is_committed(&self, mandate_id: &str) -> Result<bool, PolicyStoreError> {
        let count: i64 = self.db.with(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM policy_commits WHERE mandate_id = ?1",
                [mandate_id],
                |row| row.get(0),
            )
        })?;
        Ok(count > 0)
    }

    /// Record a spend for `mandate_id` atomically. Idempotent per mandate.
    pub fn commit(
        &self,
        agent_id: &str,
        mandate_id: &str,
        request: &SpendRequest,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, PolicyStoreError> {
        let result = self.db.with(|conn| {
            // BEGIN IMMEDIATE acquires write lock immediately
            conn.execute("BEGIN IMMEDIATE", [])?;

            let result = commit_inner(conn, agent_id, mandate_id, request, now);

            match &result {
                Ok(CommitOutcome::Committed { .. }) => {
                    conn.execute("COMMIT", [])?;
                }
                _ => {
                    let _ = conn.execute("ROLLBACK", []);
                }
            }
            result
        });

        match &result {
            Ok(CommitOutcome::Committed { version }) => {
                info!(agent_id, mandate_id, amount = request.amount_minor, version, "spend committed");
            }
            Ok(CommitOutcome::AlreadyCommitted) => {
                debug!(agent_id, mandate_id, "spend already committed");
            }
            Ok(CommitOutcome::Rejected(reason)) => {
                warn!(agent_id, mandate_id, reason = reason.as_str(), "spend rejected at commit");
            }
            Err(e) => {
                error!(agent_id, mandate_id, error = %e, "policy commit failed");
            }
        }

        result
    }

    /// Undo the spend committed for `mandate_id` and forget the commit, so
    /// the same mandate can be committed again. Returns `false` when there
    /// was nothing to undo.
    pub fn revert(&self, mandate_id: &str, now: DateTime<Utc>) -> Result<bool, PolicyStoreError> {
        let result = self.db.with(|conn| {
            conn.execute("BEGIN IMMEDIATE", [])?;

            let result = revert_inner(conn, mandate_id, now);

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

        match result {
            Ok(Some(agent_id)) => {
                info!(agent_id, mandate_id, "committed spend reverted");
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                error!(mandate_id, error = %e, "policy revert failed");
                Err(e)
            }
        }
    }
}

fn commit_inner(
    conn: &Connection,
    agent_id: &str,
    mandate_id: &str,
    request: &SpendRequest,
    now: DateTime<Utc>,
) -> Result<CommitOutcome, PolicyStoreError> {
    // Step 1: Idempotency check
    let existing: Option<String> = conn
        .query_row(
            "SELECT agent_id FROM policy_commits WHERE mandate_id = ?1",
            [mandate_id],
            |row| row.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Ok(CommitOutcome::AlreadyCommitted);
    }

    // Step 2: Load and re-check against current counters
    let VersionedPolicy {
        mut policy,
        version,
    } = load(conn, agent_id)?.ok_or_else(|| PolicyStoreError::PolicyNotFound {
        agent_id: agent_id.to_string(),
    })?;

    let rule_index = match commit_spend(&mut policy, request, now) {
        Ok(rule_index) => rule_index,
        Err(reason) => return Ok(CommitOutcome::Rejected(reason)),
    };

    // Step 3: CAS on version
    let updated = conn.execute(
        r#"
        UPDATE policies SET policy_json = ?1, version = version + 1, updated_at = ?2
        WHERE agent_id = ?3 AND version = ?4
        "#,
        params![encode(&policy)?, now.to_rfc3339(), agent_id, version],
    )?;
    if updated != 1 {
        return Err(PolicyStoreError::VersionConflict {
            agent_id: agent_id.to_string(),
        });
    }
    let new_version = version + 1;

    // Step 4: Commit log
    conn.execute(
        r#"
        INSERT INTO policy_commits
            (mandate_id, agent_id, amount_minor, merchant_id, merchant_category, scope,
             rule_index, policy_version, committed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            mandate_id,
            agent_id,
            to_sql_amount(request.amount_minor)?,
            request.merchant_id,
            request.category,
            request.scope.as_str(),
            rule_index.and_then(|i| i64::try_from(i).ok()),
            new_version,
            now.to_rfc3339(),
        ],
    )?;

    Ok(CommitOutcome::Committed {
        version: new_version,
    })
}

struct CommitRow {
    agent_id: String,
    amount_minor: i64,
    merchant_id: String,
    merchant_category: Option<String>,
    scope: String,
    rule_index: Option<i64>,
    committed_at: String,
}

/// `Some(agent_id)` when a commit was undone.
fn revert_inner(
    conn: &Connection,
    mandate_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<String>, PolicyStoreError> {
    let row = conn
        .query_row(
            r#"
            SELECT agent_id, amount_minor, merchant_id, merchant_category, scope,
                   rule_index, committed_at
            FROM policy_commits WHERE mandate_id = ?1
            "#,
            [mandate_id],
            |row| {
                Ok(CommitRow {
                    agent_id: row.get(0)?,
                    amount_minor: row.get(1)?,
                    merchant_id: row.get(2)?,
                    merchant_category: row.get(3)?,
                    scope: row.get(4)?,
                    rule_index: row.get(5)?,
                    committed_at: row.get(6)?,
                })
            },
        )
        .optional()?;
    let Some(row) = row else {
        return Ok(None);
    };

    let corrupt = |message: String| PolicyStoreError::Corrupt {
        agent_id: row.agent_id.clone(),
        message,
    };
    let scope: Scope = serde_json::from_value(serde_json::Value::String(row.scope.clone()))
        .map_err(|e| corrupt(e.to_string()))?;
    let committed_at = DateTime::parse_from_rfc3339(&row.committed_at)
        .map_err(|e| corrupt(e.to_string()))?
        .with_timezone(&Utc);
    let amount = u64::try_from(row.amount_minor).map_err(|e| corrupt(e.to_string()))?;

    let mut request = SpendRequest::new(amount, row.merchant_id.clone(), scope);
    request.category = row.merchant_category.clone();
    let rule_index = row.rule_index.and_then(|i| usize::try_from(i).ok());

    let VersionedPolicy {
        mut policy,
        version,
    } = load(conn, &row.agent_id)?.ok_or_else(|| PolicyStoreError::PolicyNotFound {
        agent_id: row.agent_id.clone(),
    })?;
    revert_spend(&mut policy, &request, rule_index, committed_at);

    let updated = conn.execute(
        r#"
        UPDATE policies SET policy_json = ?1, version = version + 1, updated_at = ?2
        WHERE agent_id = ?3 AND version = ?4
        "#,
        params![encode(&policy)?, now.to_rfc3339(), row.agent_id, version],
    )?;
    if updated != 1 {
        return Err(PolicyStoreError::VersionConflict {
            agent_id: row.agent_id.clone(),
        });
    }
    conn.execute("DELETE FROM policy_commits WHERE mandate_id = ?1", [mandate_id])?;

    Ok(Some(row.agent_id))
}

fn load(conn: &Connection, agent_id: &str) -> Result<Option<VersionedPolicy>, PolicyStoreError> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT policy_json, version FROM policies WHERE agent_id = ?1",
            [agent_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    row.map(|(json, version)| {
        let policy = serde_json::from_str(&json).map_err(|e| PolicyStoreError::Corrupt {
            agent_id: agent_id.to_string(),
            message: e.to_string(),
        })?;
        Ok(VersionedPolicy { policy, version })
    })
    .transpose()
}

fn encode(policy: &SpendingPolicy) -> Result<String, PolicyStoreError> {
    serde_json::to_string(policy).map_err(|e| PolicyStoreError::Corrupt {
        agent_id: policy.agent_id.clone(),
        message: e.to_string(),
    })
}

fn to_sql_amount(amount: u64) -> Result<i64, PolicyStoreError> {
    i64::try_from(amount).map_err(|_| PolicyStoreError::AmountOutOfRange { amount })
}
