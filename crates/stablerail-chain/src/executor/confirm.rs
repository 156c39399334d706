//! Confirmation tracking for broadcast transactions.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::B256;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::receipt::{DispatchState, PollState, ReceiptStatus};
use crate::rpc::{ChainRpc, RetryPolicy};

/// Cooperative cancellation flag shared between a caller and a dispatch.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

pub(crate) struct Poller {
    pub rpc: Arc<dyn ChainRpc>,
    pub retry: RetryPolicy,
    pub tx_hash: B256,
    pub required_confirmations: u64,
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Caller-supplied cancellation.
    pub cancel: CancelSignal,
    /// Executor-side `stop_polling`.
    pub stop: CancelSignal,
}

impl Poller {
    pub(crate) async fn run(self, state: watch::Sender<DispatchState>) {
        let deadline = Instant::now() + self.timeout;
        let mandate_id = state.borrow().receipt.mandate_id.clone();

        loop {
            if let Some(next) = self.check(&state, &mandate_id).await {
                finish(&state, next, &mandate_id);
                return;
            }

            let wake = (Instant::now() + self.poll_interval).min(deadline);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    finish(&state, PollState::Cancelled, &mandate_id);
                    return;
                }
                _ = self.stop.cancelled() => {
                    finish(&state, PollState::Cancelled, &mandate_id);
                    return;
                }
                _ = tokio::time::sleep_until(wake) => {}
            }

            if Instant::now() >= deadline {
                finish(&state, PollState::TimedOut, &mandate_id);
                return;
            }
        }
    }

    /// One poll round. Returns the terminal state if one was reached.
    async fn check(
        &self,
        state: &watch::Sender<DispatchState>,
        mandate_id: &str,
    ) -> Option<PollState> {
        let head = match self
            .retry
            .run("eth_blockNumber", || self.rpc.block_number())
            .await
        {
            Ok(head) => head,
            Err(e) => {
                warn!(mandate_id, error = %e, "poll: block number unavailable");
                return None;
            }
        };

        let receipt = match self
            .retry
            .run("eth_getTransactionReceipt", || {
                self.rpc.transaction_receipt(self.tx_hash)
            })
            .await
        {
            Ok(Some(receipt)) => receipt,
            Ok(None) => {
                debug!(mandate_id, head, "poll: not yet included");
                return None;
            }
            Err(e) => {
                warn!(mandate_id, error = %e, "poll: receipt unavailable");
                return None;
            }
        };

        if !receipt.success {
            let reason = receipt
                .revert_reason
                .unwrap_or_else(|| "execution reverted".to_string());
            state.send_modify(|s| {
                s.receipt.block_number = Some(receipt.block_number);
                s.receipt.status = ReceiptStatus::Failed;
                s.receipt.reason = Some(reason);
            });
            return Some(PollState::Failed);
        }

        let confirmations = head
            .checked_sub(receipt.block_number)
            .map_or(0, |d| d + 1);
        state.send_modify(|s| {
            s.receipt.block_number = Some(receipt.block_number);
            s.receipt.confirmations = confirmations;
        });
        debug!(
            mandate_id,
            block = receipt.block_number,
            confirmations,
            required = self.required_confirmations,
            "poll: included"
        );

        if confirmations >= self.required_confirmations {
            state.send_modify(|s| s.receipt.status = ReceiptStatus::Confirmed);
            return Some(PollState::Confirmed);
        }
        None
    }
}

fn finish(state: &watch::Sender<DispatchState>, poll: PollState, mandate_id: &str) {
    state.send_modify(|s| s.poll = poll);
    let receipt = state.borrow().receipt.clone();
    match poll {
        PollState::Confirmed => info!(
            mandate_id,
            chain = %receipt.chain,
            tx_hash = %receipt.tx_hash,
            confirmations = receipt.confirmations,
            "dispatch confirmed"
        ),
        PollState::Failed => warn!(
            mandate_id,
            chain = %receipt.chain,
            tx_hash = %receipt.tx_hash,
            reason = receipt.reason.as_deref().unwrap_or_default(),
            "dispatch failed"
        ),
        PollState::TimedOut => warn!(
            mandate_id,
            tx_hash = %receipt.tx_hash,
            "confirmation timeout; receipt left pending"
        ),
        PollState::Cancelled => info!(
            mandate_id,
            tx_hash = %receipt.tx_hash,
            "confirmation polling stopped"
        ),
        PollState::Pending => {}
    }
}
