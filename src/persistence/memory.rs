//! In-process storage backend.
//!
//! Mirrors the Postgres semantics (unique trader index, wallet CAS, dedup
//! indexes) behind one async mutex. Used for tests and `serve --memory`.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use super::traits::{dedup_conflict, IndexStore, LedgerStore, WalletMutation, WalletStore};
use crate::domain::{EntryKind, EntryRef, EntryStatus, LedgerEntry, TraderIndex, Wallet, WalletKey};
use crate::error::{CustodyError, Result};

#[derive(Default)]
struct MemoryState {
    indices: HashMap<String, u32>,
    next_index: u32,
    wallets: HashMap<WalletKey, Wallet>,
    entries: Vec<LedgerEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ledger entries across all wallets
    pub async fn entry_count(&self) -> usize {
        self.state.lock().await.entries.len()
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn get_index(&self, trader_id: &str) -> Result<Option<TraderIndex>> {
        let state = self.state.lock().await;
        Ok(state.indices.get(trader_id).map(|&hd_index| TraderIndex {
            trader_id: trader_id.to_string(),
            hd_index,
        }))
    }

    async fn allocate_index(&self, trader_id: &str) -> Result<TraderIndex> {
        let mut state = self.state.lock().await;
        if let Some(&hd_index) = state.indices.get(trader_id) {
            return Ok(TraderIndex {
                trader_id: trader_id.to_string(),
                hd_index,
            });
        }

        // Same numbering as the SERIAL column: first index is 1
        state.next_index += 1;
        let hd_index = state.next_index;
        state.indices.insert(trader_id.to_string(), hd_index);
        debug!("Allocated HD index {} for trader {}", hd_index, trader_id);

        Ok(TraderIndex {
            trader_id: trader_id.to_string(),
            hd_index,
        })
    }
}

#[async_trait]
impl WalletStore for MemoryStore {
    async fn get_wallet(&self, key: &WalletKey) -> Result<Option<Wallet>> {
        Ok(self.state.lock().await.wallets.get(key).cloned())
    }

    async fn insert_wallet(&self, wallet: &Wallet) -> Result<Wallet> {
        let mut state = self.state.lock().await;
        let stored = state
            .wallets
            .entry(wallet.key())
            .or_insert_with(|| wallet.clone());
        Ok(stored.clone())
    }

    async fn list_wallets(&self, currency: &str) -> Result<Vec<Wallet>> {
        let state = self.state.lock().await;
        let mut wallets: Vec<Wallet> = state
            .wallets
            .values()
            .filter(|w| w.currency == currency)
            .cloned()
            .collect();
        wallets.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(wallets)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn find_entry(
        &self,
        key: &WalletKey,
        kind: EntryKind,
        reference: EntryRef<'_>,
    ) -> Result<Option<LedgerEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .find(|e| {
                e.trader_id == key.trader_id
                    && e.currency == key.currency
                    && e.matches(kind, reference)
            })
            .cloned())
    }

    async fn list_entries(&self, key: &WalletKey) -> Result<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.trader_id == key.trader_id && e.currency == key.currency)
            .cloned()
            .collect())
    }

    async fn pending_withdrawals(&self, limit: u32) -> Result<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.kind == EntryKind::Withdraw && e.is_pending())
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn apply(&self, mutation: WalletMutation) -> Result<Wallet> {
        let mut state = self.state.lock().await;

        let current = state
            .wallets
            .get(&mutation.key)
            .ok_or_else(|| CustodyError::NotFound(format!("wallet {}", mutation.key)))?
            .balances();

        if current != mutation.expected {
            return Err(CustodyError::ConcurrentModification(mutation.key.to_string()));
        }

        if !mutation.next.is_valid() {
            return Err(CustodyError::InsufficientFunds(format!(
                "wallet {} would go negative",
                mutation.key
            )));
        }

        for incoming in &mutation.append {
            if let Some(err) = state
                .entries
                .iter()
                .find_map(|existing| dedup_conflict(existing, incoming))
            {
                return Err(err);
            }
        }

        let confirm_at = match mutation.confirm {
            Some(id) => Some(
                state
                    .entries
                    .iter()
                    .position(|e| e.id == id)
                    .ok_or_else(|| CustodyError::NotFound(format!("ledger entry {id}")))?,
            ),
            None => None,
        };

        // All checks passed: commit
        if let Some(pos) = confirm_at {
            state.entries[pos].status = EntryStatus::Confirmed;
        }
        state.entries.extend(mutation.append);

        let wallet = state
            .wallets
            .get_mut(&mutation.key)
            .ok_or_else(|| CustodyError::NotFound(format!("wallet {}", mutation.key)))?;
        wallet.balance = mutation.next.balance;
        wallet.frozen = mutation.next.frozen;
        wallet.updated_at = Utc::now();

        Ok(wallet.clone())
    }

    async fn confirm_withdraw(&self, tx_hash: &str) -> Result<Option<bool>> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.kind == EntryKind::Withdraw && e.tx_hash.as_deref() == Some(tx_hash));

        Ok(entry.map(|e| {
            if e.is_pending() {
                e.status = EntryStatus::Confirmed;
                true
            } else {
                false
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Balances, BTC};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn store_with_wallet() -> (MemoryStore, WalletKey) {
        let store = MemoryStore::new();
        let wallet = Wallet::new("t1", BTC, "tb1qaddr".to_string());
        store.insert_wallet(&wallet).await.unwrap();
        (store, wallet.key())
    }

    #[tokio::test]
    async fn test_allocate_index_is_idempotent_and_unique() {
        let store = MemoryStore::new();
        let a = store.allocate_index("alice").await.unwrap();
        let b = store.allocate_index("bob").await.unwrap();
        let a_again = store.allocate_index("alice").await.unwrap();

        assert_eq!(a.hd_index, 1);
        assert_eq!(b.hd_index, 2);
        assert_eq!(a, a_again);
    }

    #[tokio::test]
    async fn test_concurrent_allocation_same_trader() {
        let store = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.allocate_index("carol").await.unwrap().hd_index })
            })
            .collect();

        let mut indices = Vec::new();
        for handle in handles {
            indices.push(handle.await.unwrap());
        }
        indices.dedup();
        assert_eq!(indices, vec![1]);
    }

    #[tokio::test]
    async fn test_insert_wallet_keeps_first_row() {
        let (store, key) = store_with_wallet().await;
        let replacement = Wallet::new("t1", BTC, "tb1qother".to_string());
        let stored = store.insert_wallet(&replacement).await.unwrap();
        assert_eq!(stored.address, "tb1qaddr");
        assert_eq!(store.get_wallet(&key).await.unwrap().unwrap().address, "tb1qaddr");
    }

    #[tokio::test]
    async fn test_apply_rejects_stale_expectation() {
        let (store, key) = store_with_wallet().await;
        let mutation = WalletMutation::new(
            key,
            Balances::new(dec!(1), dec!(0)),
            Balances::new(dec!(2), dec!(0)),
        );
        let err = store.apply(mutation).await.unwrap_err();
        assert!(matches!(err, CustodyError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn test_apply_rejects_negative_balances() {
        let (store, key) = store_with_wallet().await;
        let mutation = WalletMutation::new(
            key,
            Balances::default(),
            Balances::new(dec!(-0.01), dec!(0)),
        );
        let err = store.apply(mutation).await.unwrap_err();
        assert!(matches!(err, CustodyError::InsufficientFunds(_)));
    }

    #[tokio::test]
    async fn test_apply_is_all_or_nothing_on_duplicate() {
        let (store, key) = store_with_wallet().await;
        let deposit = || {
            LedgerEntry::new("t1", BTC, EntryKind::Deposit, dec!(0.05), EntryStatus::Confirmed)
                .with_tx_hash("txA")
        };

        store
            .apply(
                WalletMutation::new(key.clone(), Balances::default(), Balances::new(dec!(0.05), dec!(0)))
                    .append(deposit()),
            )
            .await
            .unwrap();

        let err = store
            .apply(
                WalletMutation::new(
                    key.clone(),
                    Balances::new(dec!(0.05), dec!(0)),
                    Balances::new(dec!(0.10), dec!(0)),
                )
                .append(deposit()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CustodyError::DuplicateEvent(_)));
        assert_eq!(store.get_wallet(&key).await.unwrap().unwrap().balance, dec!(0.05));
        assert_eq!(store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_apply_with_unknown_confirm_target_changes_nothing() {
        let (store, key) = store_with_wallet().await;
        let err = store
            .apply(
                WalletMutation::new(key.clone(), Balances::default(), Balances::new(dec!(0.01), dec!(0)))
                    .append(
                        LedgerEntry::new("t1", BTC, EntryKind::Reward, dec!(0.01), EntryStatus::Confirmed)
                            .with_order_id("order1"),
                    )
                    .confirm(uuid::Uuid::new_v4()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CustodyError::NotFound(_)));
        assert_eq!(store.get_wallet(&key).await.unwrap().unwrap().balance, dec!(0));
        assert_eq!(store.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_confirm_withdraw_transitions_once() {
        let (store, key) = store_with_wallet().await;
        store
            .apply(
                WalletMutation::new(key.clone(), Balances::default(), Balances::default()).append(
                    LedgerEntry::new("t1", BTC, EntryKind::Withdraw, dec!(0.01), EntryStatus::Pending)
                        .with_tx_hash("txW"),
                ),
            )
            .await
            .unwrap();

        assert_eq!(store.pending_withdrawals(10).await.unwrap().len(), 1);
        assert_eq!(store.confirm_withdraw("txW").await.unwrap(), Some(true));
        assert_eq!(store.confirm_withdraw("txW").await.unwrap(), Some(false));
        assert_eq!(store.confirm_withdraw("unknown").await.unwrap(), None);
        assert!(store.pending_withdrawals(10).await.unwrap().is_empty());
    }
}
