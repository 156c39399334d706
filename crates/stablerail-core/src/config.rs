//! Settlement configuration.
//!
//! Loaded from YAML (every field optional) and overlaid with `STABLERAIL_*`
//! environment variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `STABLERAIL_REPLAY_DB` | `storage.replay_db` |
//! | `STABLERAIL_POLICY_DB` | `storage.policy_db` |
//! | `STABLERAIL_LEDGER_DB` | `storage.ledger_db` |
//! | `STABLERAIL_ANCHOR_INTERVAL_SECS` | `anchoring.interval_secs` (also enables anchoring) |
//! | `STABLERAIL_SIGNER_URL` | switches `executor.signer` to `remote_mpc` |
//! | `STABLERAIL_SIGNER_KEY_ID` | `executor.signer.key_id` |
//! | `STABLERAIL_SIGNER_CREDENTIAL` | `executor.signer.credential` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use stablerail_chain::{ExecutorConfig, RemoteSignerConfig, SignerConfig};

use crate::ledger::{Ledger, LedgerError};
use crate::policy::{PolicyStore, PolicyStoreError};
use crate::replay::{ReplayError, SqliteReplayCache};

pub const ENV_REPLAY_DB: &str = "STABLERAIL_REPLAY_DB";
pub const ENV_POLICY_DB: &str = "STABLERAIL_POLICY_DB";
pub const ENV_LEDGER_DB: &str = "STABLERAIL_LEDGER_DB";
pub const ENV_ANCHOR_INTERVAL_SECS: &str = "STABLERAIL_ANCHOR_INTERVAL_SECS";
pub const ENV_SIGNER_URL: &str = "STABLERAIL_SIGNER_URL";
pub const ENV_SIGNER_KEY_ID: &str = "STABLERAIL_SIGNER_KEY_ID";
pub const ENV_SIGNER_CREDENTIAL: &str = "STABLERAIL_SIGNER_CREDENTIAL";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SettlementConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub anchoring: AnchoringConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub dispatch: DispatchDefaults,
}

/// Database paths. An absent path means an in-memory database.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub replay_db: Option<PathBuf>,

    #[serde(default)]
    pub policy_db: Option<PathBuf>,

    #[serde(default)]
    pub ledger_db: Option<PathBuf>,
}

impl StorageConfig {
    pub fn open_replay(&self) -> Result<SqliteReplayCache, ReplayError> {
        match &self.replay_db {
            Some(path) => SqliteReplayCache::open(path),
            None => SqliteReplayCache::memory(),
        }
    }

    pub fn open_policies(&self) -> Result<PolicyStore, PolicyStoreError> {
        match &self.policy_db {
            Some(path) => PolicyStore::open(path),
            None => PolicyStore::memory(),
        }
    }

    pub fn open_ledger(&self) -> Result<Ledger, LedgerError> {
        match &self.ledger_db {
            Some(path) => Ledger::open(path),
            None => Ledger::memory(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchoringConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_anchor_interval_secs")]
    pub interval_secs: u64,
}

fn default_anchor_interval_secs() -> u64 {
    60
}

impl Default for AnchoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_anchor_interval_secs(),
        }
    }
}

impl AnchoringConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DispatchDefaults {
    /// Caller-side bound on confirmation tracking; the chain's own ceiling
    /// applies when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl SettlementConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("failed to parse settlement config")
    }

    /// Load `path` and overlay the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config = Self::from_yaml_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.apply_env()?;
        Ok(config)
    }

    /// Defaults overlaid with the environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_var(ENV_REPLAY_DB) {
            self.storage.replay_db = Some(PathBuf::from(path));
        }
        if let Some(path) = env_var(ENV_POLICY_DB) {
            self.storage.policy_db = Some(PathBuf::from(path));
        }
        if let Some(path) = env_var(ENV_LEDGER_DB) {
            self.storage.ledger_db = Some(PathBuf::from(path));
        }
        if let Some(secs) = env_var(ENV_ANCHOR_INTERVAL_SECS) {
            self.anchoring.interval_secs = secs
                .parse()
                .with_context(|| format!("{} must be an integer, got {:?}", ENV_ANCHOR_INTERVAL_SECS, secs))?;
            self.anchoring.enabled = true;
        }
        self.apply_signer_env()
    }

    fn apply_signer_env(&mut self) -> Result<()> {
        let url = env_var(ENV_SIGNER_URL);
        let key_id = env_var(ENV_SIGNER_KEY_ID);
        let credential = env_var(ENV_SIGNER_CREDENTIAL);

        if let SignerConfig::RemoteMpc(remote) = &mut self.executor.signer {
            if let Some(url) = url {
                remote.url = url;
            }
            if let Some(key_id) = key_id {
                remote.key_id = key_id;
            }
            if let Some(credential) = credential {
                remote.credential = credential;
            }
            return Ok(());
        }

        let Some(url) = url else {
            return Ok(());
        };
        let (Some(key_id), Some(credential)) = (key_id, credential) else {
            bail!(
                "{} is set but {} and {} are required for the remote signer",
                ENV_SIGNER_URL,
                ENV_SIGNER_KEY_ID,
                ENV_SIGNER_CREDENTIAL
            );
        };
        self.executor.signer = SignerConfig::RemoteMpc(RemoteSignerConfig {
            url,
            key_id,
            credential,
            timeout_secs: 10,
        });
        Ok(())
    }

    pub fn dispatch_timeout(&self) -> Option<Duration> {
        self.dispatch.timeout_secs.map(Duration::from_secs)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_is_defaults() {
        let config = SettlementConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, SettlementConfig::default());
        assert!(!config.anchoring.enabled);
        assert_eq!(config.anchoring.interval_secs, 60);
        assert!(config.storage.replay_db.is_none());
        assert_eq!(config.dispatch_timeout(), None);
    }

    #[test]
    fn test_yaml_sections() {
        let yaml = r#"
storage:
  ledger_db: /var/lib/stablerail/ledger.db
anchoring:
  enabled: true
  interval_secs: 5
dispatch:
  timeout_secs: 30
executor:
  signer:
    kind: remote_mpc
    url: https://mpc.internal
    key_id: core-01
    credential: AAAA
"#;
        let config = SettlementConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(
            config.storage.ledger_db.as_deref(),
            Some(Path::new("/var/lib/stablerail/ledger.db"))
        );
        assert!(config.anchoring.enabled);
        assert_eq!(config.anchoring.interval(), Duration::from_secs(5));
        assert_eq!(config.dispatch_timeout(), Some(Duration::from_secs(30)));
        assert!(matches!(config.executor.signer, SignerConfig::RemoteMpc(ref r) if r.key_id == "core-01"));
        // Chain table falls back to the built-in defaults.
        assert!(config.executor.chains.get("base").is_ok());
    }

    #[test]
    fn test_unknown_signer_kind_rejected() {
        let yaml = "executor:\n  signer:\n    kind: hsm\n";
        assert!(SettlementConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_in_memory_storage_opens() {
        let storage = StorageConfig::default();
        storage.open_replay().unwrap();
        storage.open_policies().unwrap();
        storage.open_ledger().unwrap();
    }
}
