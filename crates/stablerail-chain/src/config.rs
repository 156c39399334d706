//! Chain table and executor configuration.
//!
//! ```yaml
//! chains:
//!   base:
//!     chain_id: 8453
//!     rpc_url: https://mainnet.base.org
//!     required_confirmations: 2
//!     source_wallet: { wallet_id: treasury-base, address: "0x…" }
//!     stablecoins:
//!       USDC: { address: "0x8335…2913", decimals: 6 }
//! signer:
//!   kind: remote_mpc
//!   url: https://signer.internal
//!   key_id: core-01
//!   credential: <base64 ed25519 seed>
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

use crate::error::{ChainError, ChainResult};

/// An ERC-20 stablecoin deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StablecoinConfig {
    /// Contract address.
    pub address: String,

    /// Token decimals on chain.
    pub decimals: u8,

    /// Decimals of the fiat minor unit that mandate amounts are expressed in.
    #[serde(default = "default_minor_decimals")]
    pub minor_decimals: u8,
}

impl StablecoinConfig {
    pub fn contract(&self) -> ChainResult<Address> {
        parse_address(&self.address)
    }
}

/// Custodial wallet that payouts are sent from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRef {
    /// Identifier the signer knows the key under.
    pub wallet_id: String,

    /// On-chain address of the wallet.
    pub address: String,
}

impl WalletRef {
    pub fn new(wallet_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            address: address.into(),
        }
    }

    pub fn parsed_address(&self) -> ChainResult<Address> {
        parse_address(&self.address)
    }
}

/// One entry of the chain table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,

    pub rpc_url: String,

    /// Stablecoins keyed by symbol.
    #[serde(default)]
    pub stablecoins: BTreeMap<String, StablecoinConfig>,

    #[serde(default = "default_confirmations")]
    pub required_confirmations: u64,

    pub source_wallet: WalletRef,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Ceiling on how long a broadcast transaction is tracked.
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,

    /// Gas limit = estimate × gas_buffer_percent / 100.
    #[serde(default = "default_gas_buffer_percent")]
    pub gas_buffer_percent: u64,

    /// Used when the node does not implement `eth_maxPriorityFeePerGas`.
    #[serde(default = "default_priority_fee_wei")]
    pub default_priority_fee_wei: u64,

    /// Maximum retries for transient RPC failures.
    #[serde(default = "default_rpc_max_retries")]
    pub rpc_max_retries: u32,
}

fn default_minor_decimals() -> u8 {
    2
}

fn default_confirmations() -> u64 {
    1
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_confirmation_timeout_secs() -> u64 {
    120
}

fn default_gas_buffer_percent() -> u64 {
    120
}

fn default_priority_fee_wei() -> u64 {
    1_500_000_000
}

fn default_rpc_max_retries() -> u32 {
    3
}

impl ChainConfig {
    pub fn new(chain_id: u64, rpc_url: impl Into<String>, source_wallet: WalletRef) -> Self {
        Self {
            chain_id,
            rpc_url: rpc_url.into(),
            stablecoins: BTreeMap::new(),
            required_confirmations: default_confirmations(),
            source_wallet,
            poll_interval_ms: default_poll_interval_ms(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            gas_buffer_percent: default_gas_buffer_percent(),
            default_priority_fee_wei: default_priority_fee_wei(),
            rpc_max_retries: default_rpc_max_retries(),
        }
    }

    pub fn with_stablecoin(
        mut self,
        symbol: impl Into<String>,
        address: impl Into<String>,
        decimals: u8,
    ) -> Self {
        self.stablecoins.insert(
            symbol.into(),
            StablecoinConfig {
                address: address.into(),
                decimals,
                minor_decimals: default_minor_decimals(),
            },
        );
        self
    }

    pub fn with_confirmations(mut self, confirmations: u64) -> Self {
        self.required_confirmations = confirmations;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn apply_gas_buffer(&self, estimate: u64) -> u64 {
        let buffered = u128::from(estimate) * u128::from(self.gas_buffer_percent) / 100;
        u64::try_from(buffered).unwrap_or(u64::MAX).max(estimate)
    }
}

/// Static chain table keyed by chain name (`ethereum`, `base`, …).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainTable {
    chains: BTreeMap<String, ChainConfig>,
}

impl Default for ChainTable {
    fn default() -> Self {
        Self::defaults()
    }
}

impl ChainTable {
    pub fn empty() -> Self {
        Self {
            chains: BTreeMap::new(),
        }
    }

    /// Mainnet deployments of USDC/USDT on Ethereum, Base, Polygon and
    /// Arbitrum. Source wallets must be overridden before use.
    pub fn defaults() -> Self {
        let unset = "0x0000000000000000000000000000000000000000";
        Self::empty()
            .with_chain(
                "ethereum",
                ChainConfig::new(
                    1,
                    "https://ethereum-rpc.publicnode.com",
                    WalletRef::new("treasury-ethereum", unset),
                )
                .with_stablecoin("USDC", "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", 6)
                .with_stablecoin("USDT", "0xdAC17F958D2ee523a2206206994597C13D831ec7", 6)
                .with_confirmations(3),
            )
            .with_chain(
                "base",
                ChainConfig::new(
                    8453,
                    "https://mainnet.base.org",
                    WalletRef::new("treasury-base", unset),
                )
                .with_stablecoin("USDC", "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913", 6)
                .with_confirmations(2),
            )
            .with_chain(
                "polygon",
                ChainConfig::new(
                    137,
                    "https://polygon-rpc.com",
                    WalletRef::new("treasury-polygon", unset),
                )
                .with_stablecoin("USDC", "0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359", 6)
                .with_stablecoin("USDT", "0xc2132D05D31c914a87C6611C10748AEb04B58e8F", 6)
                .with_confirmations(5),
            )
            .with_chain(
                "arbitrum",
                ChainConfig::new(
                    42161,
                    "https://arb1.arbitrum.io/rpc",
                    WalletRef::new("treasury-arbitrum", unset),
                )
                .with_stablecoin("USDC", "0xaf88d065e77c8cC2239327C5EDb3A432268e5831", 6)
                .with_stablecoin("USDT", "0xFd086bC7CD5C481DCC9C85ebE478A1C0b69FCbb9", 6),
            )
    }

    pub fn with_chain(mut self, name: impl Into<String>, config: ChainConfig) -> Self {
        self.chains.insert(name.into(), config);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, config: ChainConfig) {
        self.chains.insert(name.into(), config);
    }

    pub fn get(&self, name: &str) -> ChainResult<&ChainConfig> {
        self.chains.get(name).ok_or_else(|| ChainError::UnknownChain {
            chain: name.to_string(),
        })
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ChainConfig> {
        self.chains.get_mut(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChainConfig)> {
        self.chains.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Resolve a stablecoin by chain and symbol.
    pub fn stablecoin(&self, chain: &str, token: &str) -> ChainResult<&StablecoinConfig> {
        self.get(chain)?
            .stablecoins
            .get(token)
            .ok_or_else(|| ChainError::UnknownToken {
                chain: chain.to_string(),
                token: token.to_string(),
            })
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        use anyhow::Context as _;
        serde_yaml::from_str(yaml).context("failed to parse chain table")
    }
}

/// Remote threshold-signing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSignerConfig {
    /// Base URL; requests go to `{url}/v1/sign`.
    pub url: String,

    /// Identifier of the local request-signing credential.
    pub key_id: String,

    /// Base64-encoded 32-byte Ed25519 seed used to sign requests.
    pub credential: String,

    #[serde(default = "default_signer_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_signer_timeout_secs() -> u64 {
    10
}

/// Which [`TransactionSigner`](crate::signer::TransactionSigner) to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignerConfig {
    /// Deterministic keys derived from `seed`; no I/O.
    Simulated { seed: String },
    RemoteMpc(RemoteSignerConfig),
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self::Simulated {
            seed: "stablerail-dev".to_string(),
        }
    }
}

/// Backoff for transient RPC failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub chains: ChainTable,

    #[serde(default)]
    pub signer: SignerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// HTTP timeout for a single JSON-RPC request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// How long a finished dispatch stays in memory. Within this window a
    /// repeat dispatch of the same mandate returns the original receipt.
    #[serde(default = "default_receipt_retention_secs")]
    pub receipt_retention_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_receipt_retention_secs() -> u64 {
    3600
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            chains: ChainTable::defaults(),
            signer: SignerConfig::default(),
            retry: RetryConfig::default(),
            request_timeout_secs: default_request_timeout_secs(),
            receipt_retention_secs: default_receipt_retention_secs(),
        }
    }
}

impl ExecutorConfig {
    pub fn receipt_retention(&self) -> Duration {
        Duration::from_secs(self.receipt_retention_secs)
    }

    pub fn with_chains(mut self, chains: ChainTable) -> Self {
        self.chains = chains;
        self
    }

    pub fn with_signer(mut self, signer: SignerConfig) -> Self {
        self.signer = signer;
        self
    }

    pub fn with_retry(mut self, base: Duration, max: Duration) -> Self {
        self.retry = RetryConfig {
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
        };
        self
    }
}

pub(crate) fn parse_address(s: &str) -> ChainResult<Address> {
    s.parse::<Address>().map_err(|e| ChainError::Config {
        message: format!("invalid address {}: {}", s, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_four_chains() {
        let table = ChainTable::defaults();
        let names: Vec<&str> = table.names().collect();
        assert_eq!(names, vec!["arbitrum", "base", "ethereum", "polygon"]);
        assert_eq!(table.get("base").unwrap().chain_id, 8453);
        assert_eq!(table.stablecoin("polygon", "USDC").unwrap().decimals, 6);
        assert!(table.stablecoin("base", "USDC").unwrap().contract().is_ok());
    }

    #[test]
    fn test_dispatch_defaults() {
        let base = ChainTable::defaults().get("base").unwrap().clone();
        assert_eq!(base.poll_interval(), Duration::from_secs(2));
        assert_eq!(base.confirmation_timeout(), Duration::from_secs(120));
        assert_eq!(base.gas_buffer_percent, 120);
        assert_eq!(base.apply_gas_buffer(50_000), 60_000);
    }

    #[test]
    fn test_unknown_chain_and_token() {
        let table = ChainTable::defaults();
        assert!(matches!(
            table.get("solana"),
            Err(ChainError::UnknownChain { .. })
        ));
        assert!(matches!(
            table.stablecoin("base", "DAI"),
            Err(ChainError::UnknownToken { .. })
        ));
    }

    #[test]
    fn test_yaml_table_with_defaults() {
        let yaml = r#"
base:
  chain_id: 84532
  rpc_url: http://localhost:8545
  source_wallet:
    wallet_id: hot-1
    address: "0x00000000000000000000000000000000000000f1"
  stablecoins:
    USDC:
      address: "0x036CbD53842c5426634e7929541eC2318f3dCF7e"
      decimals: 6
"#;
        let table = ChainTable::from_yaml_str(yaml).unwrap();
        let base = table.get("base").unwrap();
        assert_eq!(base.chain_id, 84532);
        assert_eq!(base.required_confirmations, 1);
        assert_eq!(base.rpc_max_retries, 3);
        assert_eq!(base.stablecoins["USDC"].minor_decimals, 2);
    }

    #[test]
    fn test_signer_config_tagged() {
        let yaml = r#"
kind: remote_mpc
url: https://signer.internal
key_id: core-01
credential: AAAA
"#;
        let signer: SignerConfig = serde_yaml::from_str(yaml).unwrap();
        match signer {
            SignerConfig::RemoteMpc(cfg) => {
                assert_eq!(cfg.key_id, "core-01");
                assert_eq!(cfg.timeout_secs, 10);
            }
            other => panic!("unexpected signer config: {:?}", other),
        }
    }
}
