//! Multi-chain stablecoin dispatch for the StableRail settlement core.
//!
//! - Static chain table (Ethereum, Base, Polygon, Arbitrum by default)
//! - EIP-1559 ERC-20 transfers with optional audit-hash calldata suffix
//! - Pluggable [`TransactionSigner`]: [`SimulatedSigner`] or [`RemoteMpcSigner`]
//! - [`ChainExecutor`]: idempotent dispatch per mandate, per-wallet nonce
//!   management, background confirmation tracking
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use stablerail_chain::{
//!     ChainExecutor, ChainTable, DispatchOptions, PaymentOrder, RetryConfig, SimulatedChain,
//!     SimulatedSigner,
//! };
//! use stablerail_mandate::PaymentBody;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let executor = ChainExecutor::new(
//!     ChainTable::defaults(),
//!     RetryConfig::default(),
//!     Arc::new(SimulatedSigner::new(b"dev")),
//! )
//! .with_rpc("base", Arc::new(SimulatedChain::new(8453)));
//!
//! let order = PaymentOrder::new(
//!     "payment-1",
//!     PaymentBody {
//!         amount_minor: 1050,
//!         token: "USDC".into(),
//!         chain: "base".into(),
//!         destination: "0x00000000000000000000000000000000000000aa".into(),
//!         audit_hash: None,
//!     },
//! );
//! let receipt = executor.dispatch_payment(&order, DispatchOptions::default()).await?;
//! println!("{} {}", receipt.tx_hash, receipt.status.as_str());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod rpc;
pub mod signer;
pub mod sim;
pub mod tx;

pub use config::{
    ChainConfig, ChainTable, ExecutorConfig, RemoteSignerConfig, RetryConfig, SignerConfig,
    StablecoinConfig, WalletRef,
};
pub use error::{ChainError, ChainResult};
pub use executor::{
    CancelSignal, ChainExecutor, ChainReceipt, DispatchOptions, DispatchState, GasEstimate,
    PaymentOrder, PollState, ReceiptStatus,
};
pub use rpc::{CallRequest, ChainRpc, JsonRpcClient, RetryPolicy, RpcReceipt};
pub use signer::{build_signer, RemoteMpcSigner, SimulatedSigner, TransactionSigner};
pub use sim::{SentTransaction, SimulatedChain};
pub use tx::{Eip1559Transaction, SignedTransaction, TxSignature};
