//! Withdrawal confirmation background service

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{bounded, report_item_failure};
use crate::chain::ChainStatusProvider;
use crate::domain::LedgerEntry;
use crate::error::Result;
use crate::ledger::Ledger;

/// Status lookups in flight per pass
const MAX_CONCURRENT_CHECKS: usize = 8;

/// Outcome counters for one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WithdrawalTickSummary {
    pub checked: u64,
    pub confirmed: u64,
    pub still_pending: u64,
    pub failures: u64,
    /// Subset of `failures` that retrying will not clear
    pub permanent_failures: u64,
}

pub struct WithdrawalReconciler {
    ledger: Arc<Ledger>,
    chain: Arc<dyn ChainStatusProvider>,
    interval: Duration,
    call_timeout: Duration,
    batch_size: u32,
}

impl WithdrawalReconciler {
    pub fn new(
        ledger: Arc<Ledger>,
        chain: Arc<dyn ChainStatusProvider>,
        interval: Duration,
        call_timeout: Duration,
        batch_size: u32,
    ) -> Self {
        Self {
            ledger,
            chain,
            interval,
            call_timeout,
            batch_size,
        }
    }

    /// Tick until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting withdrawal reconciler (interval: {}s, batch: {})",
            self.interval.as_secs(),
            self.batch_size
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reconcile_once().await {
                        Ok(summary) if summary.checked > 0 => info!(
                            checked = summary.checked,
                            confirmed = summary.confirmed,
                            still_pending = summary.still_pending,
                            failures = summary.failures,
                            permanent_failures = summary.permanent_failures,
                            "Withdrawal reconciliation tick complete"
                        ),
                        Ok(_) => debug!("No pending withdrawals"),
                        Err(e) => error!("Withdrawal reconciliation tick failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Withdrawal reconciler stopped");
    }

    /// One pass over pending withdrawals, oldest first
    pub async fn reconcile_once(&self) -> Result<WithdrawalTickSummary> {
        use futures::stream::{self, StreamExt};

        let pending = self.ledger.pending_withdrawals(self.batch_size).await?;
        let mut summary = WithdrawalTickSummary::default();

        let outcomes: Vec<_> = stream::iter(pending)
            .map(|entry| async move {
                let outcome = self.check(&entry).await;
                (entry, outcome)
            })
            .buffer_unordered(MAX_CONCURRENT_CHECKS)
            .collect()
            .await;

        for (entry, outcome) in outcomes {
            summary.checked += 1;
            match outcome {
                Ok(true) => summary.confirmed += 1,
                Ok(false) => summary.still_pending += 1,
                Err(e) => {
                    summary.failures += 1;
                    let item = format!(
                        "Status check for withdrawal {:?} of {}",
                        entry.tx_hash, entry.trader_id
                    );
                    if report_item_failure(&item, &e) {
                        summary.permanent_failures += 1;
                    }
                }
            }
        }

        Ok(summary)
    }

    async fn check(&self, entry: &LedgerEntry) -> Result<bool> {
        let Some(tx_hash) = entry.tx_hash.as_deref() else {
            warn!("Pending withdrawal {} has no tx hash", entry.id);
            return Ok(false);
        };

        let status = bounded(self.call_timeout, "get_tx", self.chain.get_tx(tx_hash)).await?;
        match status {
            Some(status) if status.confirmed => {
                self.ledger.confirm_withdraw(tx_hash).await?;
                debug!("Withdrawal {} confirmed at {:?}", tx_hash, status.block_height);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                debug!("Withdrawal {} not yet known to the chain provider", tx_hash);
                Ok(false)
            }
        }
    }
}
