//! The settlement pipeline: verify → policy → dispatch → ledger.
//!
//! [`SettlementPipeline::submit`] runs the synchronous stages and returns
//! once the transaction is broadcast. A follower task per dispatched mandate
//! waits for the terminal receipt and ledgers confirmed payments.
//!
//! Rejections at any stage are [`SettlementOutcome`] values. The order is
//! checked against the executor's chain table before any spend is committed.
//! Infrastructure errors before a broadcast revert the policy commit and
//! release the chain's replay reservations, so the same submission can be
//! retried against the same headroom.
//!
//! Store calls run on the blocking pool; the stores are synchronous SQLite.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use stablerail_chain::{
    ChainError, ChainExecutor, ChainReceipt, DispatchOptions, PaymentOrder, PollState, ReceiptStatus,
};
use stablerail_mandate::MandateChain;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{AnchoringConfig, SettlementConfig};
use crate::error::{SettlementError, SettlementResult};
use crate::events::{EventType, Notifier, SettlementEvent};
use crate::keys::KeyResolver;
use crate::ledger::{AnchorBatcher, Ledger, LedgerEntry, NewLedgerEntry};
use crate::policy::{evaluate, CommitOutcome, PolicyRejection, PolicyStore, PolicyStoreError, Scope, SpendRequest};
use crate::replay::ReplayCache;
use crate::verifier::{MandateVerifier, RejectReason};

/// A mandate chain plus the spend context the mandates do not carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRequest {
    pub chain: MandateChain,
    pub scope: Scope,
    pub merchant_category: Option<String>,
}

impl SettlementRequest {
    pub fn new(chain: MandateChain, scope: Scope) -> Self {
        Self {
            chain,
            scope,
            merchant_category: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.merchant_category = Some(category.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Rejected { reason: RejectReason },
    PolicyNotFound { agent_id: String },
    PolicyRejected { reason: PolicyRejection },
    Dispatched { receipt: ChainReceipt },
}

impl SettlementOutcome {
    pub fn receipt(&self) -> Option<&ChainReceipt> {
        match self {
            Self::Dispatched { receipt } => Some(receipt),
            _ => None,
        }
    }

    pub fn is_dispatched(&self) -> bool {
        matches!(self, Self::Dispatched { .. })
    }
}

struct PipelineInner {
    verifier: MandateVerifier,
    policies: PolicyStore,
    executor: Arc<ChainExecutor>,
    ledger: Ledger,
    notifier: Arc<dyn Notifier>,
    /// Per payment mandate; flips to `true` when the follower is done.
    followers: DashMap<String, watch::Receiver<bool>>,
}

#[derive(Clone)]
pub struct SettlementPipeline {
    inner: Arc<PipelineInner>,
    dispatch_timeout: Option<Duration>,
}

impl std::fmt::Debug for SettlementPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementPipeline")
            .field("executor", &self.inner.executor)
            .field("followers", &self.inner.followers.len())
            .field("dispatch_timeout", &self.dispatch_timeout)
            .finish()
    }
}

impl SettlementPipeline {
    pub fn new(
        verifier: MandateVerifier,
        policies: PolicyStore,
        executor: Arc<ChainExecutor>,
        ledger: Ledger,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                verifier,
                policies,
                executor,
                ledger,
                notifier,
                followers: DashMap::new(),
            }),
            dispatch_timeout: None,
        }
    }

    /// Open the configured stores and build the executor's RPC clients and
    /// signer.
    pub fn from_config(
        config: &SettlementConfig,
        resolver: Arc<dyn KeyResolver>,
        notifier: Arc<dyn Notifier>,
    ) -> SettlementResult<Self> {
        let replay: Arc<dyn ReplayCache> = Arc::new(config.storage.open_replay()?);
        let policies = config.storage.open_policies()?;
        let ledger = config.storage.open_ledger()?;
        let executor = Arc::new(ChainExecutor::from_config(&config.executor)?);

        let mut pipeline = Self::new(
            MandateVerifier::new(resolver, replay),
            policies,
            executor,
            ledger,
            notifier,
        );
        pipeline.dispatch_timeout = config.dispatch_timeout();
        Ok(pipeline)
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = Some(timeout);
        self
    }

    pub fn verifier(&self) -> &MandateVerifier {
        &self.inner.verifier
    }

    pub fn policies(&self) -> &PolicyStore {
        &self.inner.policies
    }

    pub fn executor(&self) -> &Arc<ChainExecutor> {
        &self.inner.executor
    }

    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    /// Start background anchoring if enabled. Requires a tokio runtime.
    pub fn spawn_anchoring(&self, config: &AnchoringConfig) -> Option<AnchorBatcher> {
        config
            .enabled
            .then(|| AnchorBatcher::spawn(self.inner.ledger.clone(), config.interval()))
    }

    pub async fn submit(&self, request: &SettlementRequest) -> SettlementResult<SettlementOutcome> {
        self.submit_at(request, Utc::now()).await
    }

    /// Run verification and policy at `now`, then dispatch.
    pub async fn submit_at(
        &self,
        request: &SettlementRequest,
        now: DateTime<Utc>,
    ) -> SettlementResult<SettlementOutcome> {
        let chain = &request.chain;
        let mandate_id = chain.payment.mandate_id.as_str();

        // Step 1: Verify and consume the chain
        let verdict = self.inner.verifier.verify_chain_at(chain, now).await?;
        if !verdict.accepted {
            let reason = verdict.reason.unwrap_or(RejectReason::MalformedMandate);
            self.emit(mandate_id, EventType::MandateRejected, json!({ "reason": reason.as_str() }))
                .await;
            return Ok(SettlementOutcome::Rejected { reason });
        }
        self.emit(mandate_id, EventType::MandateAccepted, json!({})).await;

        match self.settle_verified(request, now).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(mandate_id, error = %e, "settlement failed before broadcast, undoing commit and reservations");
                self.revert_commit(mandate_id, now).await;
                self.release_chain(chain).await;
                Err(e)
            }
        }
    }

    async fn settle_verified(
        &self,
        request: &SettlementRequest,
        now: DateTime<Utc>,
    ) -> SettlementResult<SettlementOutcome> {
        let chain = &request.chain;
        let payment_mandate = &chain.payment;
        let mandate_id = payment_mandate.mandate_id.as_str();
        let agent_id = payment_mandate.subject.as_str();

        let (Some(payment), Some(cart)) = (chain.payment_body(), chain.cart_body()) else {
            // Unreachable after verification accepted the chain.
            return Ok(SettlementOutcome::Rejected {
                reason: RejectReason::MalformedMandate,
            });
        };

        let mut spend = SpendRequest::new(payment.amount_minor, cart.merchant_domain.clone(), request.scope);
        if let Some(category) = &request.merchant_category {
            spend = spend.with_category(category.clone());
        }

        // Step 2: Policy lookup and evaluation
        let policies = self.inner.policies.clone();
        let agent = agent_id.to_string();
        let Some(policy) = blocking(move || Ok(policies.get(&agent)?)).await? else {
            return Ok(self.policy_not_found(mandate_id, agent_id).await);
        };
        let decision = evaluate(&policy, &spend, now);
        if !decision.allowed {
            let reason = decision.reason.unwrap_or(PolicyRejection::ScopeNotAllowed);
            return Ok(self.policy_rejected(mandate_id, agent_id, reason).await);
        }

        // Step 3: The order must be dispatchable before spend is committed
        let order = PaymentOrder::from_mandate(payment_mandate)?;
        self.inner.executor.check_order(&order)?;

        // Step 4: Commit against the stored counters
        let policies = self.inner.policies.clone();
        let (agent, mandate) = (agent_id.to_string(), mandate_id.to_string());
        let committed = blocking(move || Ok(policies.commit(&agent, &mandate, &spend, now))).await?;
        match committed {
            Ok(CommitOutcome::Committed { .. }) | Ok(CommitOutcome::AlreadyCommitted) => {}
            Ok(CommitOutcome::Rejected(reason)) => {
                return Ok(self.policy_rejected(mandate_id, agent_id, reason).await);
            }
            Err(PolicyStoreError::PolicyNotFound { .. }) => {
                return Ok(self.policy_not_found(mandate_id, agent_id).await);
            }
            Err(e) => return Err(e.into()),
        }

        // Step 5: Dispatch
        let mut options = DispatchOptions::default();
        if let Some(timeout) = self.dispatch_timeout {
            options = options.with_timeout(timeout);
        }
        let receipt = self.inner.executor.dispatch_payment(&order, options).await?;

        info!(
            mandate_id,
            agent_id,
            chain = %receipt.chain,
            tx_hash = %receipt.tx_hash,
            status = receipt.status.as_str(),
            "payment dispatched"
        );
        if receipt.status == ReceiptStatus::Pending {
            self.emit(
                mandate_id,
                EventType::DispatchPending,
                json!({ "chain": receipt.chain, "tx_hash": receipt.tx_hash }),
            )
            .await;
        }
        self.spawn_follower(mandate_id);

        Ok(SettlementOutcome::Dispatched { receipt })
    }

    /// Ledger `mandate_id` if its receipt is confirmed. Idempotent; emits
    /// `ledger_recorded` only for the call that created the entry.
    pub async fn finalize(&self, mandate_id: &str) -> SettlementResult<Option<LedgerEntry>> {
        finalize_inner(&self.inner, mandate_id).await
    }

    /// Wait for `mandate_id` to reach a terminal receipt and return its
    /// ledger entry, if it was confirmed.
    pub async fn wait_settled(&self, mandate_id: &str) -> SettlementResult<Option<LedgerEntry>> {
        let follower = self.inner.followers.get(mandate_id).map(|f| f.value().clone());
        if let Some(mut done) = follower {
            // A dropped sender means the follower exited; its work is done
            // or logged.
            let _ = done.wait_for(|finished| *finished).await;
            return ledger_get(&self.inner, mandate_id).await;
        }

        // No follower: finished and removed, or never spawned here.
        if let Some(entry) = ledger_get(&self.inner, mandate_id).await? {
            return Ok(Some(entry));
        }
        self.inner.executor.wait_terminal(mandate_id).await?;
        self.finalize(mandate_id).await
    }

    /// Followers still tracking a dispatched payment.
    pub fn follower_count(&self) -> usize {
        self.inner.followers.len()
    }

    fn spawn_follower(&self, mandate_id: &str) {
        let tx = match self.inner.followers.entry(mandate_id.to_string()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(false);
                slot.insert(rx);
                tx
            }
        };

        let inner = Arc::clone(&self.inner);
        let mandate_id = mandate_id.to_string();
        tokio::spawn(async move {
            follow(&inner, &mandate_id).await;
            let _ = tx.send(true);
            inner.followers.remove(&mandate_id);
        });
    }

    async fn revert_commit(&self, mandate_id: &str, now: DateTime<Utc>) {
        let policies = self.inner.policies.clone();
        let mandate = mandate_id.to_string();
        if let Err(e) = blocking(move || Ok(policies.revert(&mandate, now)?)).await {
            error!(mandate_id, error = %e, "failed to revert policy commit");
        }
    }

    async fn release_chain(&self, chain: &MandateChain) {
        let replay = Arc::clone(self.inner.verifier.replay_cache());
        let ids = chain.mandates().map(|m| m.mandate_id.clone());
        let released = blocking(move || {
            for id in &ids {
                if let Err(e) = replay.release(id) {
                    error!(mandate_id = %id, error = %e, "failed to release replay reservation");
                }
            }
            Ok(())
        })
        .await;
        if let Err(e) = released {
            error!(mandate_id = %chain.payment.mandate_id, error = %e, "failed to release replay reservations");
        }
    }

    async fn policy_not_found(&self, mandate_id: &str, agent_id: &str) -> SettlementOutcome {
        warn!(mandate_id, agent_id, "no spending policy for agent");
        self.emit(
            mandate_id,
            EventType::PolicyRejected,
            json!({ "reason": "policy_not_found", "agent_id": agent_id }),
        )
        .await;
        SettlementOutcome::PolicyNotFound {
            agent_id: agent_id.to_string(),
        }
    }

    async fn policy_rejected(
        &self,
        mandate_id: &str,
        agent_id: &str,
        reason: PolicyRejection,
    ) -> SettlementOutcome {
        warn!(mandate_id, agent_id, reason = reason.as_str(), "spend rejected by policy");
        self.emit(
            mandate_id,
            EventType::PolicyRejected,
            json!({ "reason": reason.as_str(), "agent_id": agent_id }),
        )
        .await;
        SettlementOutcome::PolicyRejected { reason }
    }

    async fn emit(&self, mandate_id: &str, event_type: EventType, detail: serde_json::Value) {
        emit(&self.inner, mandate_id, event_type, detail).await;
    }
}

/// Run a store call on the blocking pool.
async fn blocking<T, F>(f: F) -> SettlementResult<T>
where
    F: FnOnce() -> SettlementResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SettlementError::Task(e.to_string()))?
}

async fn ledger_get(inner: &PipelineInner, mandate_id: &str) -> SettlementResult<Option<LedgerEntry>> {
    let ledger = inner.ledger.clone();
    let mandate = mandate_id.to_string();
    blocking(move || Ok(ledger.get(&mandate)?)).await
}

async fn emit(inner: &PipelineInner, mandate_id: &str, event_type: EventType, detail: serde_json::Value) {
    inner
        .notifier
        .notify(SettlementEvent::new(mandate_id, event_type, Utc::now(), detail))
        .await;
}

async fn follow(inner: &PipelineInner, mandate_id: &str) {
    let receipt = match inner.executor.wait_terminal(mandate_id).await {
        Ok(receipt) => receipt,
        Err(e) => {
            error!(mandate_id, error = %e, "lost track of dispatched payment");
            return;
        }
    };
    let poll = inner.executor.poll_state(mandate_id);

    match receipt.status {
        ReceiptStatus::Confirmed => {
            emit(
                inner,
                mandate_id,
                EventType::DispatchConfirmed,
                json!({
                    "tx_hash": receipt.tx_hash,
                    "block_number": receipt.block_number,
                    "confirmations": receipt.confirmations,
                }),
            )
            .await;
            if let Err(e) = finalize_inner(inner, mandate_id).await {
                error!(mandate_id, error = %e, "failed to ledger confirmed payment");
            }
        }
        ReceiptStatus::Failed => {
            emit(
                inner,
                mandate_id,
                EventType::DispatchFailed,
                json!({ "tx_hash": receipt.tx_hash, "reason": receipt.reason }),
            )
            .await;
        }
        ReceiptStatus::Pending => {
            // Timed out or cancelled; reconciliation calls finalize later.
            warn!(
                mandate_id,
                tx_hash = %receipt.tx_hash,
                poll = ?poll.unwrap_or(PollState::Pending),
                "payment left pending"
            );
        }
    }
}

async fn finalize_inner(inner: &PipelineInner, mandate_id: &str) -> SettlementResult<Option<LedgerEntry>> {
    let receipt = inner
        .executor
        .receipt(mandate_id)
        .ok_or_else(|| ChainError::UnknownDispatch {
            mandate_id: mandate_id.to_string(),
        })?;
    if !receipt.is_confirmed() {
        debug!(mandate_id, status = receipt.status.as_str(), "not confirmed, nothing to ledger");
        return Ok(None);
    }

    let ledger = inner.ledger.clone();
    let entry = NewLedgerEntry::from_receipt(&receipt);
    let record = blocking(move || Ok(ledger.record(&entry, Utc::now())?)).await?;
    if record.was_new {
        emit(
            inner,
            mandate_id,
            EventType::LedgerRecorded,
            json!({ "tx_id": record.entry.tx_id, "seq": record.entry.seq }),
        )
        .await;
    }
    Ok(Some(record.entry))
}
