//! SQLite schemas for the durable stores.
//!
//! Each store owns its own database file (or in-memory connection), so the
//! DDL is split per store. All statements are idempotent.
//!
//! Timestamps used in comparisons are stored as unix milliseconds; display
//! timestamps as RFC 3339 text.

/// Consumed mandate identifiers.
pub const REPLAY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS replay_reservations (
    mandate_id       TEXT PRIMARY KEY,
    expires_at_ms    INTEGER NOT NULL,
    reserved_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_replay_expires
    ON replay_reservations(expires_at_ms);
"#;

/// Spending policies and the commit log that makes commits idempotent.
pub const POLICY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS policies (
    agent_id         TEXT PRIMARY KEY,
    policy_json      TEXT NOT NULL,
    version          INTEGER NOT NULL,
    updated_at       TEXT NOT NULL
);

-- One row per committed payment mandate. Removed only when the payment
-- fails before broadcast and its spend is reverted.
CREATE TABLE IF NOT EXISTS policy_commits (
    mandate_id       TEXT PRIMARY KEY,
    agent_id         TEXT NOT NULL REFERENCES policies(agent_id),
    amount_minor     INTEGER NOT NULL,
    merchant_id      TEXT NOT NULL,
    merchant_category TEXT,
    scope            TEXT NOT NULL,
    rule_index       INTEGER,
    policy_version   INTEGER NOT NULL,
    committed_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_policy_commits_agent
    ON policy_commits(agent_id);
"#;

/// Settlement ledger. Rows are never updated or deleted.
pub const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_entries (
    seq              INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_id            TEXT NOT NULL UNIQUE,
    mandate_id       TEXT NOT NULL UNIQUE,
    from_address     TEXT NOT NULL,
    to_address       TEXT NOT NULL,
    amount_minor     INTEGER NOT NULL,
    currency         TEXT NOT NULL,
    chain            TEXT NOT NULL,
    chain_tx_hash    TEXT NOT NULL,
    audit_anchor     TEXT,
    created_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_anchors (
    anchor_id        TEXT PRIMARY KEY,
    merkle_root      TEXT NOT NULL,
    first_seq        INTEGER NOT NULL,
    last_seq         INTEGER NOT NULL UNIQUE,
    entry_count      INTEGER NOT NULL,
    anchored_at      TEXT NOT NULL
);
"#;
