//! Deposit reconciliation background service
//!
//! Each tick walks every wallet, reads the confirmed history of its address
//! from the chain provider and credits payments that the ledger has not seen.
//! The ledger's durable deposit entries are the only dedup authority; the
//! in-memory cache just avoids re-asking the store for old txids. It keeps
//! only txids seen in the latest pass, so it is bounded by the history the
//! provider returns.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::{bounded, report_item_failure};
use crate::chain::ChainStatusProvider;
use crate::domain::{sats_to_btc, Wallet, WalletKey};
use crate::error::{CustodyError, Result};
use crate::ledger::Ledger;

/// Outcome counters for one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DepositTickSummary {
    pub wallets_checked: u64,
    pub credited: u64,
    pub already_credited: u64,
    pub failures: u64,
    /// Subset of `failures` that retrying will not clear
    pub permanent_failures: u64,
}

pub struct DepositReconciler {
    ledger: Arc<Ledger>,
    chain: Arc<dyn ChainStatusProvider>,
    currency: String,
    interval: Duration,
    call_timeout: Duration,
    /// Credited txids, tagged with the pass that last observed them
    seen: DashMap<(WalletKey, String), u64>,
    pass: AtomicU64,
}

impl DepositReconciler {
    pub fn new(
        ledger: Arc<Ledger>,
        chain: Arc<dyn ChainStatusProvider>,
        currency: &str,
        interval: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            chain,
            currency: currency.to_string(),
            interval,
            call_timeout,
            seen: DashMap::new(),
            pass: AtomicU64::new(0),
        }
    }

    /// Txids currently held by the fast-path cache
    pub fn cached_txids(&self) -> usize {
        self.seen.len()
    }

    /// Tick until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting deposit reconciler (interval: {}s)",
            self.interval.as_secs()
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reconcile_once().await {
                        Ok(summary) => info!(
                            wallets_checked = summary.wallets_checked,
                            credited = summary.credited,
                            already_credited = summary.already_credited,
                            failures = summary.failures,
                            permanent_failures = summary.permanent_failures,
                            "Deposit reconciliation tick complete"
                        ),
                        Err(e) => error!("Deposit reconciliation tick failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Deposit reconciler stopped");
    }

    /// One pass over all wallets. Fails only if the wallet list itself cannot be read.
    pub async fn reconcile_once(&self) -> Result<DepositTickSummary> {
        let wallets = self.ledger.wallets(&self.currency).await?;
        let pass = self.pass.fetch_add(1, Ordering::Relaxed) + 1;
        let mut summary = DepositTickSummary::default();

        for wallet in wallets {
            summary.wallets_checked += 1;
            if let Err(e) = self.reconcile_wallet(&wallet, pass, &mut summary).await {
                summary.failures += 1;
                let item = format!("Deposit check for {} ({})", wallet.key(), wallet.address);
                if report_item_failure(&item, &e) {
                    summary.permanent_failures += 1;
                }
            }
        }

        // Txids that dropped out of every history fall back to the durable check
        self.seen.retain(|_, last_pass| *last_pass == pass);
        Ok(summary)
    }

    async fn reconcile_wallet(
        &self,
        wallet: &Wallet,
        pass: u64,
        summary: &mut DepositTickSummary,
    ) -> Result<()> {
        let key = wallet.key();
        let txs = bounded(
            self.call_timeout,
            "get_address_txs",
            self.chain.get_address_txs(&wallet.address),
        )
        .await?;

        for tx in txs {
            if !tx.confirmed {
                continue;
            }
            // Change from our own withdrawals comes back to this address
            if tx.spends_from(&wallet.address) {
                debug!("Skipping {}: spends from {}", tx.txid, wallet.address);
                continue;
            }

            let paid = tx.paid_to(&wallet.address);
            if paid == 0 {
                continue;
            }

            let seen_key = (key.clone(), tx.txid.clone());
            if let Some(mut last_pass) = self.seen.get_mut(&seen_key) {
                *last_pass = pass;
                summary.already_credited += 1;
                continue;
            }

            if self.ledger.is_deposit_credited(&key, &tx.txid).await? {
                self.seen.insert(seen_key, pass);
                summary.already_credited += 1;
                continue;
            }

            let amount = sats_to_btc(paid);
            match self
                .ledger
                .credit_deposit(&key.trader_id, &key.currency, amount, &tx.txid)
                .await
            {
                Ok(_) => {
                    self.seen.insert(seen_key, pass);
                    summary.credited += 1;
                    debug!("Credited {} sat from {} to {}", paid, tx.txid, key);
                }
                Err(CustodyError::DuplicateEvent(_)) => {
                    self.seen.insert(seen_key, pass);
                    summary.already_credited += 1;
                }
                Err(e) => {
                    summary.failures += 1;
                    if report_item_failure(&format!("Crediting {} to {}", tx.txid, key), &e) {
                        summary.permanent_failures += 1;
                    }
                }
            }
        }

        Ok(())
    }
}
