//! In-memory chain for development and tests.
//!
//! [`SimulatedChain`] decodes and sender-recovers every raw transaction, so
//! it enforces the same nonce rules a node would. With auto-mining on, each
//! `eth_blockNumber` call mines one block containing the mempool.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use tracing::debug;

use crate::error::{ChainError, ChainResult};
use crate::rpc::{CallRequest, ChainRpc, RpcReceipt};
use crate::tx::{recover_sender, Eip1559Transaction};

/// A transaction the simulated node accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransaction {
    pub hash: B256,
    pub from: Address,
    pub tx: Eip1559Transaction,
}

#[derive(Debug)]
struct SimState {
    head: u64,
    nonces: HashMap<Address, u64>,
    mempool: Vec<B256>,
    receipts: HashMap<B256, RpcReceipt>,
    sent: Vec<SentTransaction>,
    auto_mine: bool,
    base_fee: u128,
    priority_fee: Option<u128>,
    gas_estimate: u64,
    fail_next: u32,
    lose_broadcast_responses: u32,
    revert_next: Option<Option<String>>,
}

#[derive(Debug)]
pub struct SimulatedChain {
    chain_id: u64,
    state: Mutex<SimState>,
}

impl SimulatedChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(SimState {
                head: 0,
                nonces: HashMap::new(),
                mempool: Vec::new(),
                receipts: HashMap::new(),
                sent: Vec::new(),
                auto_mine: true,
                base_fee: 1_000_000_000,
                priority_fee: Some(1_500_000_000),
                gas_estimate: 52_000,
                fail_next: 0,
                lose_broadcast_responses: 0,
                revert_next: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_auto_mine(self, auto_mine: bool) -> Self {
        self.state().auto_mine = auto_mine;
        self
    }

    /// Report `eth_maxPriorityFeePerGas` as unsupported.
    pub fn without_priority_fee_method(self) -> Self {
        self.state().priority_fee = None;
        self
    }

    /// The next `n` RPC calls fail with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.state().fail_next = n;
    }

    /// The next `n` accepted broadcasts answer with a transport error.
    pub fn lose_broadcast_responses(&self, n: u32) {
        self.state().lose_broadcast_responses = n;
    }

    /// The next mined transaction reverts, optionally with a reason.
    pub fn revert_next(&self, reason: Option<&str>) {
        self.state().revert_next = Some(reason.map(String::from));
    }

    /// Simulate transactions sent from `address` outside this executor.
    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.state().nonces.insert(address, nonce);
    }

    /// Mine one block with everything in the mempool.
    pub fn mine_block(&self) -> u64 {
        let mut state = self.state();
        mine(&mut state)
    }

    pub fn head(&self) -> u64 {
        self.state().head
    }

    pub fn sent_transactions(&self) -> Vec<SentTransaction> {
        self.state().sent.clone()
    }

    pub fn broadcast_count(&self) -> usize {
        self.state().sent.len()
    }

    fn take_failure(&self, method: &str) -> ChainResult<()> {
        let mut state = self.state();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(ChainError::RpcUnavailable {
                message: format!("simulated transport failure on {}", method),
            });
        }
        Ok(())
    }
}

fn mine(state: &mut SimState) -> u64 {
    state.head += 1;
    let block = state.head;
    for hash in std::mem::take(&mut state.mempool) {
        let receipt = match state.revert_next.take() {
            Some(reason) => RpcReceipt {
                block_number: block,
                success: false,
                revert_reason: reason,
            },
            None => RpcReceipt {
                block_number: block,
                success: true,
                revert_reason: None,
            },
        };
        state.receipts.insert(hash, receipt);
    }
    block
}

#[async_trait]
impl ChainRpc for SimulatedChain {
    async fn pending_nonce(&self, address: Address) -> ChainResult<u64> {
        self.take_failure("eth_getTransactionCount")?;
        Ok(self.state().nonces.get(&address).copied().unwrap_or(0))
    }

    async fn base_fee(&self) -> ChainResult<u128> {
        self.take_failure("eth_getBlockByNumber")?;
        Ok(self.state().base_fee)
    }

    async fn max_priority_fee(&self) -> ChainResult<Option<u128>> {
        self.take_failure("eth_maxPriorityFeePerGas")?;
        Ok(self.state().priority_fee)
    }

    async fn estimate_gas(&self, _call: &CallRequest) -> ChainResult<u64> {
        self.take_failure("eth_estimateGas")?;
        Ok(self.state().gas_estimate)
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> ChainResult<B256> {
        self.take_failure("eth_sendRawTransaction")?;

        let (tx, signature) = Eip1559Transaction::decode_signed(raw)?;
        if tx.chain_id != self.chain_id {
            return Err(ChainError::BroadcastRejected {
                message: format!("invalid chain id {}", tx.chain_id),
            });
        }
        let from = recover_sender(&tx, &signature)?;
        let hash = alloy_primitives::keccak256(raw);

        let mut state = self.state();
        if state.sent.iter().any(|s| s.hash == hash) {
            return Err(ChainError::AlreadyKnown {
                message: "already known".to_string(),
            });
        }
        let expected = state.nonces.get(&from).copied().unwrap_or(0);
        if tx.nonce < expected {
            return Err(ChainError::StaleNonce {
                message: format!("nonce too low: next nonce {}, tx nonce {}", expected, tx.nonce),
            });
        }
        if tx.nonce > expected {
            return Err(ChainError::BroadcastRejected {
                message: format!("nonce too high: next nonce {}, tx nonce {}", expected, tx.nonce),
            });
        }

        state.nonces.insert(from, expected + 1);
        state.mempool.push(hash);
        state.sent.push(SentTransaction { hash, from, tx });
        debug!(%from, nonce = expected, "simulated broadcast accepted");

        if state.lose_broadcast_responses > 0 {
            state.lose_broadcast_responses -= 1;
            return Err(ChainError::RpcUnavailable {
                message: "simulated lost response".to_string(),
            });
        }
        Ok(hash)
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> ChainResult<Option<RpcReceipt>> {
        self.take_failure("eth_getTransactionReceipt")?;
        Ok(self.state().receipts.get(&tx_hash).cloned())
    }

    async fn block_number(&self) -> ChainResult<u64> {
        self.take_failure("eth_blockNumber")?;
        let mut state = self.state();
        if state.auto_mine {
            mine(&mut state);
        }
        Ok(state.head)
    }
}
