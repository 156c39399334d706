//! Settlement events and the [`Notifier`] sink they are delivered to.
//!
//! Delivery is fire-and-forget: a notifier must not fail or stall
//! settlement, so [`Notifier::notify`] returns nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MandateAccepted,
    MandateRejected,
    PolicyRejected,
    DispatchPending,
    DispatchConfirmed,
    DispatchFailed,
    LedgerRecorded,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MandateAccepted => "mandate_accepted",
            Self::MandateRejected => "mandate_rejected",
            Self::PolicyRejected => "policy_rejected",
            Self::DispatchPending => "dispatch_pending",
            Self::DispatchConfirmed => "dispatch_confirmed",
            Self::DispatchFailed => "dispatch_failed",
            Self::LedgerRecorded => "ledger_recorded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub mandate_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl SettlementEvent {
    pub fn new(
        mandate_id: impl Into<String>,
        event_type: EventType,
        timestamp: DateTime<Utc>,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            mandate_id: mandate_id.into(),
            event_type,
            timestamp,
            detail,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: SettlementEvent);
}

/// Logs every event at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: SettlementEvent) {
        info!(
            mandate_id = %event.mandate_id,
            event_type = event.event_type.as_str(),
            detail = %event.detail,
            "settlement event"
        );
    }
}

/// Forwards events into a bounded channel. Events are dropped (with a
/// warning) when the channel is full or closed.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<SettlementEvent>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SettlementEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, event: SettlementEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let (reason, event) = match e {
                mpsc::error::TrySendError::Full(ev) => ("full", ev),
                mpsc::error::TrySendError::Closed(ev) => ("closed", ev),
            };
            warn!(
                mandate_id = %event.mandate_id,
                event_type = event.event_type.as_str(),
                reason,
                "settlement event dropped"
            );
        }
    }
}
