use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{Ledger, LedgerAnchor};

/// Background task that anchors pending ledger entries on an interval.
///
/// Anchoring runs on the blocking pool; a failed batch is logged and retried
/// on the next tick. Settlement never waits on it.
#[derive(Debug)]
pub struct AnchorBatcher {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl AnchorBatcher {
    /// Must be called from within a tokio runtime.
    pub fn spawn(ledger: Ledger, interval: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.changed() => break,
                }
                anchor_once(&ledger).await;
            }
            // Flush what arrived since the last tick.
            anchor_once(&ledger).await;
            info!("anchor batcher stopped");
        });

        debug!(interval_ms = interval.as_millis() as u64, "anchor batcher started");
        Self { shutdown, handle }
    }

    /// Stop the task after one final anchoring pass.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "anchor batcher task failed");
        }
    }
}

async fn anchor_once(ledger: &Ledger) -> Option<LedgerAnchor> {
    let ledger = ledger.clone();
    match tokio::task::spawn_blocking(move || ledger.anchor_pending(Utc::now())).await {
        Ok(Ok(anchor)) => anchor,
        Ok(Err(e)) => {
            error!(error = %e, retryable = e.is_retryable(), "ledger anchoring failed");
            None
        }
        Err(e) => {
            error!(error = %e, "ledger anchoring task panicked");
            None
        }
    }
}
