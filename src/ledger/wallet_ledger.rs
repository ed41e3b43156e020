use dashmap::DashMap;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument};

use super::allocator::IndexAllocator;
use crate::domain::{
    validate_amount, Balances, EntryKind, EntryRef, EntryStatus, LedgerEntry, Wallet, WalletKey,
    BTC_DECIMALS,
};
use crate::error::{CustodyError, Result};
use crate::persistence::{Storage, WalletMutation};
use crate::signing::KeyDerivation;

/// Entries written by a successful release
#[derive(Debug, Clone, Serialize)]
pub struct Release {
    pub release: LedgerEntry,
    pub reward: LedgerEntry,
}

/// Funds checked and the wallet held for one withdrawal.
///
/// The wallet stays locked until the reservation is committed or dropped;
/// dropping it leaves the ledger untouched.
pub struct WithdrawReservation {
    key: WalletKey,
    address: String,
    amount: Decimal,
    expected: Balances,
    _guard: OwnedMutexGuard<()>,
}

impl WithdrawReservation {
    pub fn key(&self) -> &WalletKey {
        &self.key
    }

    /// Custody address the withdrawal spends from
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }
}

impl std::fmt::Debug for WithdrawReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WithdrawReservation")
            .field("key", &self.key)
            .field("amount", &self.amount)
            .finish()
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CustodyError::InvalidInput(format!("{field} is required")));
    }
    Ok(())
}

/// Sole writer of wallet balances and ledger entries.
///
/// Mutations of one wallet are serialized by an in-process lock and land in
/// storage as a single compare-and-swap unit, so duplicate checks and balance
/// updates can never interleave.
pub struct Ledger {
    store: Arc<dyn Storage>,
    indices: IndexAllocator,
    keys: KeyDerivation,
    locks: DashMap<WalletKey, Arc<Mutex<()>>>,
}

impl Ledger {
    pub fn new<S: Storage + 'static>(store: Arc<S>, keys: KeyDerivation) -> Self {
        let indices = IndexAllocator::new(store.clone());
        Self {
            store,
            indices,
            keys,
            locks: DashMap::new(),
        }
    }

    pub fn indices(&self) -> &IndexAllocator {
        &self.indices
    }

    async fn lock(&self, key: &WalletKey) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    async fn load(&self, key: &WalletKey) -> Result<Wallet> {
        self.store
            .get_wallet(key)
            .await?
            .ok_or_else(|| CustodyError::NotFound(format!("wallet {key}")))
    }

    /// Create the trader's wallet, or return the existing one
    #[instrument(skip(self))]
    pub async fn create_wallet(&self, trader_id: &str, currency: &str) -> Result<Wallet> {
        require("trader_id", trader_id)?;
        require("currency", currency)?;

        let key = WalletKey::new(trader_id, currency);
        let _guard = self.lock(&key).await;

        if let Some(existing) = self.store.get_wallet(&key).await? {
            return Ok(existing);
        }

        let index = self.indices.allocate(trader_id).await?;
        let address = self.keys.address(index)?;
        let wallet = self
            .store
            .insert_wallet(&Wallet::new(trader_id, currency, address.to_string()))
            .await?;

        info!("Created wallet {} at {} (index {})", key, wallet.address, index);
        Ok(wallet)
    }

    /// Credit a confirmed on-chain deposit, once per txid
    #[instrument(skip(self))]
    pub async fn credit_deposit(
        &self,
        trader_id: &str,
        currency: &str,
        amount: Decimal,
        tx_hash: &str,
    ) -> Result<LedgerEntry> {
        let amount = validate_amount(amount)?;
        require("tx_hash", tx_hash)?;

        let key = WalletKey::new(trader_id, currency);
        let _guard = self.lock(&key).await;
        let wallet = self.load(&key).await?;

        if self
            .store
            .find_entry(&key, EntryKind::Deposit, EntryRef::Tx(tx_hash))
            .await?
            .is_some()
        {
            return Err(CustodyError::DuplicateEvent(format!(
                "deposit {tx_hash} already credited"
            )));
        }

        let current = wallet.balances();
        let next = Balances::new(current.balance + amount, current.frozen);
        let entry = LedgerEntry::new(trader_id, currency, EntryKind::Deposit, amount, EntryStatus::Confirmed)
            .with_tx_hash(tx_hash);

        self.store
            .apply(WalletMutation::new(key.clone(), current, next).append(entry.clone()))
            .await?;

        info!("Credited {} {} to {} (tx {})", amount, currency, key, tx_hash);
        Ok(entry)
    }

    /// Move `amount` from balance to frozen under `order_id`
    #[instrument(skip(self))]
    pub async fn freeze(
        &self,
        trader_id: &str,
        currency: &str,
        amount: Decimal,
        order_id: &str,
    ) -> Result<LedgerEntry> {
        let amount = validate_amount(amount)?;
        require("order_id", order_id)?;

        let key = WalletKey::new(trader_id, currency);
        let _guard = self.lock(&key).await;
        let wallet = self.load(&key).await?;

        // A replay must read as a duplicate even once the funds are gone
        if self
            .store
            .find_entry(&key, EntryKind::Freeze, EntryRef::Order(order_id))
            .await?
            .is_some()
        {
            return Err(CustodyError::DuplicateEvent(format!(
                "order {order_id} already frozen"
            )));
        }
        if wallet.balance < amount {
            return Err(CustodyError::InsufficientFunds(format!(
                "balance {} < freeze amount {}",
                wallet.balance, amount
            )));
        }

        let current = wallet.balances();
        let next = Balances::new(current.balance - amount, current.frozen + amount);
        let entry = LedgerEntry::new(trader_id, currency, EntryKind::Freeze, amount, EntryStatus::Pending)
            .with_order_id(order_id);

        self.store
            .apply(WalletMutation::new(key.clone(), current, next).append(entry.clone()))
            .await?;

        info!("Froze {} {} on {} for order {}", amount, currency, key, order_id);
        Ok(entry)
    }

    /// Settle a frozen order: drop the principal from frozen and credit the reward.
    ///
    /// Only the reward returns to balance; the principal leaves the wallet.
    #[instrument(skip(self))]
    pub async fn release(
        &self,
        trader_id: &str,
        currency: &str,
        order_id: &str,
        reward_rate: Decimal,
    ) -> Result<Release> {
        require("order_id", order_id)?;
        if reward_rate < Decimal::ZERO || reward_rate > Decimal::ONE {
            return Err(CustodyError::InvalidInput(format!(
                "reward rate {reward_rate} outside [0, 1]"
            )));
        }

        let key = WalletKey::new(trader_id, currency);
        let _guard = self.lock(&key).await;
        let wallet = self.load(&key).await?;

        let freeze = self
            .store
            .find_entry(&key, EntryKind::Freeze, EntryRef::Order(order_id))
            .await?
            .ok_or_else(|| CustodyError::NotFound(format!("no frozen funds for order {order_id}")))?;

        if self
            .store
            .find_entry(&key, EntryKind::Release, EntryRef::Order(order_id))
            .await?
            .is_some()
        {
            return Err(CustodyError::AlreadyReleased {
                order_id: order_id.to_string(),
            });
        }

        let amount = freeze.amount;
        let reward = (amount * reward_rate)
            .round_dp_with_strategy(BTC_DECIMALS, RoundingStrategy::MidpointAwayFromZero);

        let current = wallet.balances();
        if current.frozen < amount {
            return Err(CustodyError::InsufficientFunds(format!(
                "frozen {} < released amount {}",
                current.frozen, amount
            )));
        }
        let next = Balances::new(current.balance + reward, current.frozen - amount);

        let release_entry =
            LedgerEntry::new(trader_id, currency, EntryKind::Release, amount, EntryStatus::Confirmed)
                .with_order_id(order_id);
        let reward_entry =
            LedgerEntry::new(trader_id, currency, EntryKind::Reward, reward, EntryStatus::Confirmed)
                .with_order_id(order_id)
                .with_metadata(json!({
                    "reward_rate": reward_rate.to_string(),
                    "principal": amount.to_string(),
                }));

        self.store
            .apply(
                WalletMutation::new(key.clone(), current, next)
                    .append(release_entry.clone())
                    .append(reward_entry.clone())
                    .confirm(freeze.id),
            )
            .await?;

        info!(
            "Released {} {} on {} for order {} (reward {})",
            amount, currency, key, order_id, reward
        );
        Ok(Release {
            release: release_entry,
            reward: reward_entry,
        })
    }

    /// Check funds and hold the wallet for an outgoing transfer
    #[instrument(skip(self))]
    pub async fn begin_withdraw(
        &self,
        trader_id: &str,
        currency: &str,
        amount: Decimal,
    ) -> Result<WithdrawReservation> {
        let amount = validate_amount(amount)?;

        let key = WalletKey::new(trader_id, currency);
        let guard = self.lock(&key).await;
        let wallet = self.load(&key).await?;

        if wallet.balance < amount {
            return Err(CustodyError::InsufficientFunds(format!(
                "balance {} < withdrawal amount {}",
                wallet.balance, amount
            )));
        }

        Ok(WithdrawReservation {
            key,
            expected: wallet.balances(),
            address: wallet.address,
            amount,
            _guard: guard,
        })
    }

    /// Debit a broadcast withdrawal and record it as pending
    #[instrument(skip(self))]
    pub async fn commit_withdraw(
        &self,
        reservation: WithdrawReservation,
        tx_hash: &str,
    ) -> Result<LedgerEntry> {
        require("tx_hash", tx_hash)?;

        let key = reservation.key.clone();
        let amount = reservation.amount;
        let current = reservation.expected;
        let next = Balances::new(current.balance - amount, current.frozen);
        let entry = LedgerEntry::new(
            &key.trader_id,
            &key.currency,
            EntryKind::Withdraw,
            amount,
            EntryStatus::Pending,
        )
        .with_tx_hash(tx_hash);

        self.store
            .apply(WalletMutation::new(key.clone(), current, next).append(entry.clone()))
            .await?;
        drop(reservation);

        info!("Debited {} {} from {} (tx {})", amount, key.currency, key, tx_hash);
        Ok(entry)
    }

    /// Mark a broadcast withdrawal as confirmed; `false` if it already was
    #[instrument(skip(self))]
    pub async fn confirm_withdraw(&self, tx_hash: &str) -> Result<bool> {
        match self.store.confirm_withdraw(tx_hash).await? {
            Some(true) => {
                info!("Withdrawal {} confirmed", tx_hash);
                Ok(true)
            }
            Some(false) => Ok(false),
            None => Err(CustodyError::NotFound(format!("withdrawal {tx_hash}"))),
        }
    }

    pub async fn wallet(&self, trader_id: &str, currency: &str) -> Result<Wallet> {
        self.load(&WalletKey::new(trader_id, currency)).await
    }

    pub async fn wallets(&self, currency: &str) -> Result<Vec<Wallet>> {
        self.store.list_wallets(currency).await
    }

    pub async fn entries(&self, trader_id: &str, currency: &str) -> Result<Vec<LedgerEntry>> {
        self.store.list_entries(&WalletKey::new(trader_id, currency)).await
    }

    pub async fn pending_withdrawals(&self, limit: u32) -> Result<Vec<LedgerEntry>> {
        self.store.pending_withdrawals(limit).await
    }

    pub async fn is_deposit_credited(&self, key: &WalletKey, tx_hash: &str) -> Result<bool> {
        Ok(self
            .store
            .find_entry(key, EntryKind::Deposit, EntryRef::Tx(tx_hash))
            .await?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BTC;
    use crate::persistence::MemoryStore;
    use crate::signing::derivation::tests::test_keys;
    use rust_decimal_macros::dec;

    async fn funded_ledger(amount: Decimal) -> Ledger {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()), test_keys());
        ledger.create_wallet("trader1", BTC).await.unwrap();
        ledger
            .credit_deposit("trader1", BTC, amount, "txA")
            .await
            .unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_create_wallet_is_idempotent() {
        let keys = test_keys();
        let ledger = Ledger::new(Arc::new(MemoryStore::new()), keys.clone());

        let first = ledger.create_wallet("trader1", BTC).await.unwrap();
        let second = ledger.create_wallet("trader1", BTC).await.unwrap();

        assert_eq!(first.address, second.address);
        assert_eq!(first.balance, Decimal::ZERO);
        let index = ledger.indices().lookup("trader1").await.unwrap().unwrap();
        assert_eq!(first.address, keys.address(index).unwrap().to_string());
    }

    #[tokio::test]
    async fn test_duplicate_deposit_credits_once() {
        let ledger = funded_ledger(dec!(0.05)).await;
        let err = ledger
            .credit_deposit("trader1", BTC, dec!(0.05), "txA")
            .await
            .unwrap_err();

        assert!(matches!(err, CustodyError::DuplicateEvent(_)));
        assert_eq!(ledger.wallet("trader1", BTC).await.unwrap().balance, dec!(0.05));
        let key = WalletKey::new("trader1", BTC);
        assert!(ledger.is_deposit_credited(&key, "txA").await.unwrap());
        assert!(!ledger.is_deposit_credited(&key, "txB").await.unwrap());
    }

    #[tokio::test]
    async fn test_deposit_to_missing_wallet() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()), test_keys());
        let err = ledger
            .credit_deposit("ghost", BTC, dec!(1), "tx")
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_freeze_checks_balance_and_order() {
        let ledger = funded_ledger(dec!(0.05)).await;

        let err = ledger.freeze("trader1", BTC, dec!(0.06), "order1").await.unwrap_err();
        assert!(matches!(err, CustodyError::InsufficientFunds(_)));

        let entry = ledger.freeze("trader1", BTC, dec!(0.02), "order1").await.unwrap();
        assert!(entry.is_pending());

        let err = ledger.freeze("trader1", BTC, dec!(0.01), "order1").await.unwrap_err();
        assert!(matches!(err, CustodyError::DuplicateEvent(_)));

        let wallet = ledger.wallet("trader1", BTC).await.unwrap();
        assert_eq!(wallet.balance, dec!(0.03));
        assert_eq!(wallet.frozen, dec!(0.02));
    }

    #[tokio::test]
    async fn test_freeze_replay_after_full_freeze_is_duplicate() {
        let ledger = funded_ledger(dec!(0.05)).await;
        ledger.freeze("trader1", BTC, dec!(0.05), "order1").await.unwrap();

        let err = ledger.freeze("trader1", BTC, dec!(0.05), "order1").await.unwrap_err();
        assert!(matches!(err, CustodyError::DuplicateEvent(_)));

        let wallet = ledger.wallet("trader1", BTC).await.unwrap();
        assert_eq!(wallet.balance, Decimal::ZERO);
        assert_eq!(wallet.frozen, dec!(0.05));
    }

    #[tokio::test]
    async fn test_release_credits_reward_once() {
        let ledger = funded_ledger(dec!(0.05)).await;
        ledger.freeze("trader1", BTC, dec!(0.02), "order1").await.unwrap();

        let release = ledger.release("trader1", BTC, "order1", dec!(0.01)).await.unwrap();
        assert_eq!(release.release.amount, dec!(0.02));
        assert_eq!(release.reward.amount, dec!(0.0002));
        assert_eq!(release.reward.order_id.as_deref(), Some("order1"));

        let wallet = ledger.wallet("trader1", BTC).await.unwrap();
        assert_eq!(wallet.frozen, Decimal::ZERO);
        assert_eq!(wallet.balance, dec!(0.0302));

        let err = ledger.release("trader1", BTC, "order1", dec!(0.01)).await.unwrap_err();
        assert!(matches!(err, CustodyError::AlreadyReleased { .. }));

        let entries = ledger.entries("trader1", BTC).await.unwrap();
        let freeze = entries.iter().find(|e| e.kind == EntryKind::Freeze).unwrap();
        assert_eq!(freeze.status, EntryStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_release_unknown_order() {
        let ledger = funded_ledger(dec!(0.05)).await;
        let err = ledger.release("trader1", BTC, "nope", dec!(0.01)).await.unwrap_err();
        assert!(matches!(err, CustodyError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_release_rate_bounds_and_rounding() {
        let ledger = funded_ledger(dec!(1)).await;
        ledger.freeze("trader1", BTC, dec!(0.00000015), "tiny").await.unwrap();

        let err = ledger.release("trader1", BTC, "tiny", dec!(1.5)).await.unwrap_err();
        assert!(matches!(err, CustodyError::InvalidInput(_)));

        // 0.00000015 * 0.1 = 0.000000015 -> rounds half away from zero
        let release = ledger.release("trader1", BTC, "tiny", dec!(0.1)).await.unwrap();
        assert_eq!(release.reward.amount, dec!(0.00000002));
    }

    #[tokio::test]
    async fn test_dropped_reservation_leaves_ledger_unchanged() {
        let ledger = funded_ledger(dec!(0.05)).await;
        {
            let reservation = ledger.begin_withdraw("trader1", BTC, dec!(0.01)).await.unwrap();
            assert_eq!(reservation.amount(), dec!(0.01));
        }
        assert_eq!(ledger.wallet("trader1", BTC).await.unwrap().balance, dec!(0.05));

        let err = ledger.begin_withdraw("trader1", BTC, dec!(0.06)).await.unwrap_err();
        assert!(matches!(err, CustodyError::InsufficientFunds(_)));
    }

    #[tokio::test]
    async fn test_withdraw_commit_and_confirm() {
        let ledger = funded_ledger(dec!(0.05)).await;
        let reservation = ledger.begin_withdraw("trader1", BTC, dec!(0.01)).await.unwrap();
        let entry = ledger.commit_withdraw(reservation, "txW").await.unwrap();

        assert!(entry.is_pending());
        assert_eq!(ledger.wallet("trader1", BTC).await.unwrap().balance, dec!(0.04));
        assert_eq!(ledger.pending_withdrawals(10).await.unwrap().len(), 1);

        assert!(ledger.confirm_withdraw("txW").await.unwrap());
        assert!(!ledger.confirm_withdraw("txW").await.unwrap());
        assert!(ledger.pending_withdrawals(10).await.unwrap().is_empty());

        let err = ledger.confirm_withdraw("unknown").await.unwrap_err();
        assert!(matches!(err, CustodyError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reservation_holds_wallet_lock() {
        let ledger = Arc::new(funded_ledger(dec!(0.05)).await);
        let reservation = ledger.begin_withdraw("trader1", BTC, dec!(0.01)).await.unwrap();

        let contender = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.freeze("trader1", BTC, dec!(0.05), "order1").await })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        ledger.commit_withdraw(reservation, "txW").await.unwrap();
        let err = contender.await.unwrap().unwrap_err();
        assert!(matches!(err, CustodyError::InsufficientFunds(_)));
    }
}
