//! Payment dispatch.
//!
//! # Dispatch protocol
//!
//! ```text
//! 1. Resolve chain, token, source wallet; build transfer calldata
//! 2. Fees: base fee (latest block) + priority fee; gas = estimate × buffer
//! 3. Under the wallet's nonce lock: nonce (cached, else pending count)
//! 4. Sign through the TransactionSigner
//! 5. eth_sendRawTransaction
//!    already known: the node holds this transaction, treat as sent
//!    nonce too low: sent if the original hash has a receipt, otherwise
//!    refresh, re-sign, rebroadcast once
//! 6. Spawn the confirmation poller
//! ```
//!
//! Dispatch is idempotent per `mandate_id`: concurrent and repeated calls
//! observe the same transaction. Anything that fails before a signature
//! exists returns `Err` and leaves no trace, so the call can be repeated.
//!
//! A dispatch stays tracked until its receipt is terminal plus the receipt
//! retention; after that it is evicted from memory.

mod confirm;
mod receipt;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, U256};
use dashmap::DashMap;
use stablerail_mandate::{Mandate, PaymentBody};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

pub use confirm::CancelSignal;
pub use receipt::{ChainReceipt, DispatchState, GasEstimate, PollState, ReceiptStatus};

use crate::config::{ChainConfig, ChainTable, ExecutorConfig, RetryConfig};
use crate::error::{ChainError, ChainResult};
use crate::rpc::{CallRequest, ChainRpc, JsonRpcClient, RetryPolicy};
use crate::signer::{build_signer, TransactionSigner};
use crate::tx::{
    erc20_transfer_calldata, minor_to_base_units, parse_audit_hash, Eip1559Transaction,
    SignedTransaction,
};
use confirm::Poller;

/// A payment mandate reduced to what dispatch needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentOrder {
    pub mandate_id: String,
    pub payment: PaymentBody,
}

impl PaymentOrder {
    pub fn new(mandate_id: impl Into<String>, payment: PaymentBody) -> Self {
        Self {
            mandate_id: mandate_id.into(),
            payment,
        }
    }

    pub fn from_mandate(mandate: &Mandate) -> ChainResult<Self> {
        let payment = mandate
            .payment()
            .ok_or_else(|| ChainError::InvalidPayment {
                message: format!(
                    "mandate {} is a {} mandate, not a payment",
                    mandate.mandate_id,
                    mandate.mandate_type()
                ),
            })?;
        Ok(Self::new(mandate.mandate_id.clone(), payment.clone()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Upper bound on confirmation tracking; the chain's ceiling still
    /// applies.
    pub timeout: Option<Duration>,
    pub cancel: CancelSignal,
}

impl DispatchOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }
}

struct Tracked {
    state: watch::Receiver<DispatchState>,
    stop: CancelSignal,
}

/// Everything resolved from the chain table for one transfer.
struct Transfer<'a> {
    chain_name: &'a str,
    chain: &'a ChainConfig,
    rpc: Arc<dyn ChainRpc>,
    from: Address,
    token_contract: Address,
    recipient: Address,
    data: Bytes,
}

enum Broadcast {
    Sent,
    /// Transport failed; the node may or may not have the transaction.
    Unknown,
    Rejected(String),
}

pub struct ChainExecutor {
    chains: ChainTable,
    retry: RetryConfig,
    rpcs: HashMap<String, Arc<dyn ChainRpc>>,
    signer: Arc<dyn TransactionSigner>,
    /// Serializes dispatch per mandate.
    slots: Arc<DashMap<String, Arc<Mutex<()>>>>,
    tracked: Arc<DashMap<String, Arc<Tracked>>>,
    /// Next nonce per `chain:wallet_id`; `None` means ask the chain.
    /// Bounded by the chain table.
    nonces: DashMap<String, Arc<Mutex<Option<u64>>>>,
    retention: Duration,
}

impl std::fmt::Debug for ChainExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainExecutor")
            .field("chains", &self.chains.names().collect::<Vec<_>>())
            .field("signer", &self.signer.name())
            .field("tracked", &self.tracked.len())
            .finish()
    }
}

impl ChainExecutor {
    /// Executor without RPC backends; attach them with [`with_rpc`](Self::with_rpc).
    pub fn new(chains: ChainTable, retry: RetryConfig, signer: Arc<dyn TransactionSigner>) -> Self {
        Self {
            chains,
            retry,
            rpcs: HashMap::new(),
            signer,
            slots: Arc::new(DashMap::new()),
            tracked: Arc::new(DashMap::new()),
            nonces: DashMap::new(),
            retention: ExecutorConfig::default().receipt_retention(),
        }
    }

    /// Build JSON-RPC clients for every configured chain and the configured
    /// signer.
    pub fn from_config(config: &ExecutorConfig) -> ChainResult<Self> {
        let signer = build_signer(&config.signer)?;
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let mut executor = Self::new(config.chains.clone(), config.retry, signer)
            .with_receipt_retention(config.receipt_retention());
        for (name, chain) in config.chains.iter() {
            let client = JsonRpcClient::new(chain.rpc_url.clone(), timeout)?;
            executor.rpcs.insert(name.to_string(), Arc::new(client));
        }
        Ok(executor)
    }

    pub fn with_rpc(mut self, chain: impl Into<String>, rpc: Arc<dyn ChainRpc>) -> Self {
        self.rpcs.insert(chain.into(), rpc);
        self
    }

    pub fn with_receipt_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn chains(&self) -> &ChainTable {
        &self.chains
    }

    /// Dispatches currently held in memory, finished or not.
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    fn retry_policy(&self, chain: &ChainConfig) -> RetryPolicy {
        RetryPolicy::new(chain.rpc_max_retries, &self.retry)
    }

    fn prepare<'a>(&'a self, order: &'a PaymentOrder) -> ChainResult<Transfer<'a>> {
        let payment = &order.payment;
        let chain_name = payment.chain.as_str();
        let chain = self.chains.get(chain_name)?;
        let token = self.chains.stablecoin(chain_name, &payment.token)?;
        let rpc = self
            .rpcs
            .get(chain_name)
            .cloned()
            .ok_or_else(|| ChainError::Config {
                message: format!("no rpc backend for chain {}", chain_name),
            })?;

        let recipient = payment
            .destination
            .parse::<Address>()
            .map_err(|e| ChainError::InvalidPayment {
                message: format!("invalid destination {}: {}", payment.destination, e),
            })?;
        let amount = minor_to_base_units(payment.amount_minor, token.decimals, token.minor_decimals)?;
        let audit = payment
            .audit_hash
            .as_deref()
            .map(parse_audit_hash)
            .transpose()?;

        Ok(Transfer {
            chain_name,
            chain,
            rpc,
            from: chain.source_wallet.parsed_address()?,
            token_contract: token.contract()?,
            recipient,
            data: erc20_transfer_calldata(recipient, amount, audit),
        })
    }

    async fn quote(&self, transfer: &Transfer<'_>) -> ChainResult<GasEstimate> {
        let retry = self.retry_policy(transfer.chain);
        let rpc = transfer.rpc.as_ref();

        let base_fee = retry.run("eth_getBlockByNumber", || rpc.base_fee()).await?;
        let priority = retry
            .run("eth_maxPriorityFeePerGas", || rpc.max_priority_fee())
            .await?
            .unwrap_or(u128::from(transfer.chain.default_priority_fee_wei));

        let call = CallRequest {
            from: transfer.from,
            to: transfer.token_contract,
            value: U256::ZERO,
            data: transfer.data.clone(),
        };
        let estimate = retry
            .run("eth_estimateGas", || rpc.estimate_gas(&call))
            .await?;
        let gas_limit = transfer.chain.apply_gas_buffer(estimate);

        let max_fee = base_fee.saturating_mul(2).saturating_add(priority);
        Ok(GasEstimate {
            chain: transfer.chain_name.to_string(),
            gas_limit,
            base_fee_per_gas: base_fee,
            max_priority_fee_per_gas: priority,
            max_fee_per_gas: max_fee,
            max_cost_wei: max_fee.saturating_mul(u128::from(gas_limit)),
        })
    }

    /// Fee and gas quote for a payment, without signing anything.
    pub async fn estimate_gas(&self, order: &PaymentOrder) -> ChainResult<GasEstimate> {
        let transfer = self.prepare(order)?;
        self.quote(&transfer).await
    }

    /// Check that `order` names a configured chain, token and wallet and a
    /// valid destination, without touching the network.
    pub fn check_order(&self, order: &PaymentOrder) -> ChainResult<()> {
        self.prepare(order).map(|_| ())
    }

    /// Dispatch a payment, or return the receipt of the earlier dispatch of
    /// the same mandate.
    pub async fn dispatch_payment(
        &self,
        order: &PaymentOrder,
        options: DispatchOptions,
    ) -> ChainResult<ChainReceipt> {
        let slot = self
            .slots
            .entry(order.mandate_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = slot.lock().await;

        if let Some(receipt) = self.receipt(&order.mandate_id) {
            debug!(mandate_id = %order.mandate_id, tx_hash = %receipt.tx_hash, "dispatch already recorded");
            return Ok(receipt);
        }

        match self.dispatch_new(order, options).await {
            Ok(tracked) => {
                let receipt = tracked.state.borrow().receipt.clone();
                self.tracked.insert(order.mandate_id.clone(), Arc::clone(&tracked));
                self.schedule_eviction(&order.mandate_id, &tracked);
                Ok(receipt)
            }
            Err(e) => {
                // Keep the slot while other callers are queued on it; they
                // retry the dispatch under the same lock.
                self.slots.remove_if(&order.mandate_id, |_, s| {
                    Arc::ptr_eq(s, &slot) && Arc::strong_count(s) <= 2
                });
                Err(e)
            }
        }
    }

    /// Forget `mandate_id` once its tracking has ended and the retention
    /// has passed.
    fn schedule_eviction(&self, mandate_id: &str, tracked: &Arc<Tracked>) {
        let mut state = tracked.state.clone();
        let entry: Weak<Tracked> = Arc::downgrade(tracked);
        let tracked_map = Arc::clone(&self.tracked);
        let slots = Arc::clone(&self.slots);
        let retention = self.retention;
        let mandate_id = mandate_id.to_string();

        tokio::spawn(async move {
            // A closed channel still holds the last published state.
            let _ = state.wait_for(|s| s.poll.is_terminal()).await;
            drop(state);
            tokio::time::sleep(retention).await;

            // A later dispatch of the same mandate owns its own entry.
            let removed = tracked_map
                .remove_if(&mandate_id, |_, t| std::ptr::eq(Arc::as_ptr(t), entry.as_ptr()))
                .is_some();
            slots.remove_if(&mandate_id, |_, s| Arc::strong_count(s) == 1);
            if removed {
                debug!(mandate_id = %mandate_id, "finished dispatch evicted");
            }
        });
    }

    fn nonce_lock(&self, chain: &str, wallet_id: &str) -> Arc<Mutex<Option<u64>>> {
        self.nonces
            .entry(format!("{}:{}", chain, wallet_id))
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn dispatch_new(
        &self,
        order: &PaymentOrder,
        options: DispatchOptions,
    ) -> ChainResult<Arc<Tracked>> {
        let mandate_id = order.mandate_id.as_str();
        if options.cancel.is_cancelled() {
            return Err(ChainError::Cancelled);
        }

        let transfer = self.prepare(order)?;
        let chain = transfer.chain;
        let wallet_id = chain.source_wallet.wallet_id.as_str();
        let retry = self.retry_policy(chain);
        let rpc = transfer.rpc.as_ref();
        let quote = self.quote(&transfer).await?;

        let build = |nonce: u64| Eip1559Transaction {
            chain_id: chain.chain_id,
            nonce,
            max_priority_fee_per_gas: quote.max_priority_fee_per_gas,
            max_fee_per_gas: quote.max_fee_per_gas,
            gas_limit: quote.gas_limit,
            to: transfer.token_contract,
            value: U256::ZERO,
            data: transfer.data.clone(),
        };

        let nonce_lock = self.nonce_lock(transfer.chain_name, wallet_id);
        let mut next_nonce = nonce_lock.lock().await;

        let nonce = match *next_nonce {
            Some(n) => n,
            None => {
                retry
                    .run("eth_getTransactionCount", || rpc.pending_nonce(transfer.from))
                    .await?
            }
        };

        if options.cancel.is_cancelled() {
            return Err(ChainError::Cancelled);
        }

        let mut signed = self.sign(wallet_id, &build(nonce), mandate_id).await?;
        let mut used_nonce = nonce;

        let mut outcome = self.broadcast(rpc, &retry, &signed).await;
        let stale = match &outcome {
            Err(ChainError::StaleNonce { message }) => Some(message.clone()),
            _ => None,
        };
        if let Some(message) = stale {
            if self.is_included(rpc, &retry, &signed).await {
                info!(mandate_id, nonce, "stale nonce answer for a transaction already on chain");
                outcome = Ok(Broadcast::Sent);
            } else {
                warn!(mandate_id, nonce, error = %message, "stale nonce; refreshing and re-signing");
                match retry
                    .run("eth_getTransactionCount", || rpc.pending_nonce(transfer.from))
                    .await
                {
                    Ok(fresh) => {
                        signed = self.sign(wallet_id, &build(fresh), mandate_id).await?;
                        used_nonce = fresh;
                        outcome = self.broadcast(rpc, &retry, &signed).await;
                    }
                    Err(e) => outcome = Err(e),
                }
            }
        }

        let broadcast = match outcome {
            Ok(b) => b,
            Err(e) if e.is_retryable() => Broadcast::Unknown,
            Err(e) => Broadcast::Rejected(e.to_string()),
        };

        *next_nonce = match broadcast {
            Broadcast::Sent | Broadcast::Unknown => Some(used_nonce + 1),
            Broadcast::Rejected(_) => None,
        };
        drop(next_nonce);

        let payment = &order.payment;
        let mut receipt = ChainReceipt {
            mandate_id: order.mandate_id.clone(),
            tx_hash: signed.hash_hex(),
            chain: payment.chain.clone(),
            block_number: None,
            confirmations: 0,
            audit_anchor: payment.audit_hash.clone(),
            status: ReceiptStatus::Pending,
            reason: None,
            from: transfer.from.to_checksum(None),
            to: transfer.recipient.to_checksum(None),
            amount_minor: payment.amount_minor,
            token: payment.token.clone(),
        };

        let stop = CancelSignal::new();
        let poll = match &broadcast {
            Broadcast::Rejected(reason) => {
                warn!(mandate_id, tx_hash = %receipt.tx_hash, reason = %reason, "broadcast rejected");
                receipt.status = ReceiptStatus::Failed;
                receipt.reason = Some(reason.clone());
                PollState::Failed
            }
            Broadcast::Sent => {
                info!(
                    mandate_id,
                    chain = %payment.chain,
                    tx_hash = %receipt.tx_hash,
                    nonce = used_nonce,
                    "transaction broadcast"
                );
                PollState::Pending
            }
            Broadcast::Unknown => {
                warn!(mandate_id, tx_hash = %receipt.tx_hash, "broadcast outcome unknown; tracking hash");
                PollState::Pending
            }
        };

        let (state_tx, state_rx) = watch::channel(DispatchState { poll, receipt });

        if poll == PollState::Pending {
            let timeout = options
                .timeout
                .map_or(chain.confirmation_timeout(), |t| t.min(chain.confirmation_timeout()));
            let poller = Poller {
                rpc: transfer.rpc.clone(),
                retry,
                tx_hash: signed.hash,
                required_confirmations: chain.required_confirmations,
                poll_interval: chain.poll_interval(),
                timeout,
                cancel: options.cancel.clone(),
                stop: stop.clone(),
            };
            tokio::spawn(poller.run(state_tx));
        }

        Ok(Arc::new(Tracked {
            state: state_rx,
            stop,
        }))
    }

    async fn sign(
        &self,
        wallet_id: &str,
        tx: &Eip1559Transaction,
        mandate_id: &str,
    ) -> ChainResult<SignedTransaction> {
        self.signer.sign(wallet_id, tx).await.map_err(|e| {
            error!(mandate_id, wallet_id, signer = self.signer.name(), error = %e, "signing failed");
            e
        })
    }

    /// Broadcast with retries. A stale-nonce answer to a retry after a
    /// transport failure means an earlier attempt already landed.
    async fn broadcast(
        &self,
        rpc: &dyn ChainRpc,
        retry: &RetryPolicy,
        signed: &SignedTransaction,
    ) -> ChainResult<Broadcast> {
        let transport_failed = AtomicBool::new(false);
        let flag = &transport_failed;
        let raw = &signed.raw;

        let result = retry
            .run("eth_sendRawTransaction", move || async move {
                let result = rpc.send_raw_transaction(raw).await;
                if matches!(&result, Err(e) if e.is_retryable()) {
                    flag.store(true, Ordering::SeqCst);
                }
                result
            })
            .await;

        match result {
            Ok(_) | Err(ChainError::AlreadyKnown { .. }) => Ok(Broadcast::Sent),
            Err(ChainError::StaleNonce { .. }) if transport_failed.load(Ordering::SeqCst) => {
                Ok(Broadcast::Sent)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether `signed` already has a receipt. Lookup failures count as no.
    async fn is_included(&self, rpc: &dyn ChainRpc, retry: &RetryPolicy, signed: &SignedTransaction) -> bool {
        matches!(
            retry
                .run("eth_getTransactionReceipt", || rpc.transaction_receipt(signed.hash))
                .await,
            Ok(Some(_))
        )
    }

    /// Current receipt of a dispatched mandate.
    pub fn receipt(&self, mandate_id: &str) -> Option<ChainReceipt> {
        self.tracked
            .get(mandate_id)
            .map(|t| t.state.borrow().receipt.clone())
    }

    pub fn poll_state(&self, mandate_id: &str) -> Option<PollState> {
        self.tracked.get(mandate_id).map(|t| t.state.borrow().poll)
    }

    /// Watch tracker transitions of a dispatched mandate.
    pub fn subscribe(&self, mandate_id: &str) -> Option<watch::Receiver<DispatchState>> {
        self.tracked.get(mandate_id).map(|t| t.state.clone())
    }

    /// Wait until tracking of `mandate_id` ends and return the final receipt.
    pub async fn wait_terminal(&self, mandate_id: &str) -> ChainResult<ChainReceipt> {
        let mut rx = self
            .subscribe(mandate_id)
            .ok_or_else(|| ChainError::UnknownDispatch {
                mandate_id: mandate_id.to_string(),
            })?;
        // A closed channel still holds the last state the poller published.
        let _ = rx.wait_for(|s| s.poll.is_terminal()).await;
        let receipt = rx.borrow().receipt.clone();
        Ok(receipt)
    }

    /// Stop confirmation polling; the receipt keeps its current status.
    pub fn stop_polling(&self, mandate_id: &str) -> bool {
        match self.tracked.get(mandate_id) {
            Some(t) => {
                t.stop.cancel();
                true
            }
            None => false,
        }
    }
}
