//! Chain JSON-RPC capability.
//!
//! The executor only needs the handful of calls below, so anything that can
//! answer them (a node over HTTP, [`SimulatedChain`](crate::sim::SimulatedChain))
//! can back a chain.

pub mod http;
pub mod retry;

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;

use crate::error::ChainResult;

pub use http::JsonRpcClient;
pub use retry::RetryPolicy;

/// Parameters for `eth_estimateGas`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

/// The subset of a transaction receipt the executor reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcReceipt {
    pub block_number: u64,
    /// `status == 0x1`.
    pub success: bool,
    /// Some nodes attach a decoded revert reason.
    pub revert_reason: Option<String>,
}

#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// `eth_getTransactionCount(address, "pending")`
    async fn pending_nonce(&self, address: Address) -> ChainResult<u64>;

    /// `baseFeePerGas` of `eth_getBlockByNumber("latest")`.
    async fn base_fee(&self) -> ChainResult<u128>;

    /// `eth_maxPriorityFeePerGas`; `None` when the node does not support it.
    async fn max_priority_fee(&self) -> ChainResult<Option<u128>>;

    async fn estimate_gas(&self, call: &CallRequest) -> ChainResult<u64>;

    /// `eth_sendRawTransaction`; returns the transaction hash.
    async fn send_raw_transaction(&self, raw: &Bytes) -> ChainResult<B256>;

    /// `eth_getTransactionReceipt`; `None` while not yet included.
    async fn transaction_receipt(&self, tx_hash: B256) -> ChainResult<Option<RpcReceipt>>;

    /// `eth_blockNumber`
    async fn block_number(&self) -> ChainResult<u64>;
}
