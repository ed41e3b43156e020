use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{Balances, EntryKind, EntryRef, LedgerEntry, TraderIndex, Wallet, WalletKey};
use crate::error::{CustodyError, Result};

/// One atomic change to a wallet and its ledger.
///
/// Applied all-or-nothing: the wallet must still hold `expected`, the new
/// balances must be non-negative, and no appended entry may collide with an
/// existing one on its dedup key.
#[derive(Debug, Clone)]
pub struct WalletMutation {
    pub key: WalletKey,
    pub expected: Balances,
    pub next: Balances,
    pub append: Vec<LedgerEntry>,
    /// Pending entry to move to confirmed in the same unit
    pub confirm: Option<Uuid>,
}

impl WalletMutation {
    pub fn new(key: WalletKey, expected: Balances, next: Balances) -> Self {
        Self {
            key,
            expected,
            next,
            append: Vec::new(),
            confirm: None,
        }
    }

    pub fn append(mut self, entry: LedgerEntry) -> Self {
        self.append.push(entry);
        self
    }

    pub fn confirm(mut self, entry_id: Uuid) -> Self {
        self.confirm = Some(entry_id);
        self
    }
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn get_index(&self, trader_id: &str) -> Result<Option<TraderIndex>>;

    /// Return the trader's index, assigning the next unused one if it has none.
    ///
    /// Concurrent first-time calls for the same trader must converge on one index.
    async fn allocate_index(&self, trader_id: &str) -> Result<TraderIndex>;
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn get_wallet(&self, key: &WalletKey) -> Result<Option<Wallet>>;

    /// Insert the wallet unless one exists for its key; returns the stored row.
    async fn insert_wallet(&self, wallet: &Wallet) -> Result<Wallet>;

    async fn list_wallets(&self, currency: &str) -> Result<Vec<Wallet>>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn find_entry(
        &self,
        key: &WalletKey,
        kind: EntryKind,
        reference: EntryRef<'_>,
    ) -> Result<Option<LedgerEntry>>;

    async fn list_entries(&self, key: &WalletKey) -> Result<Vec<LedgerEntry>>;

    /// Oldest first
    async fn pending_withdrawals(&self, limit: u32) -> Result<Vec<LedgerEntry>>;

    /// Apply a [`WalletMutation`] atomically and return the updated wallet.
    async fn apply(&self, mutation: WalletMutation) -> Result<Wallet>;

    /// Move the withdraw entry for `tx_hash` to confirmed.
    ///
    /// `None` if no such entry exists, `Some(false)` if it was already confirmed.
    async fn confirm_withdraw(&self, tx_hash: &str) -> Result<Option<bool>>;
}

/// A backend providing every repository the ledger needs
pub trait Storage: IndexStore + WalletStore + LedgerStore {}

impl<T: IndexStore + WalletStore + LedgerStore> Storage for T {}

/// Dedup rules shared by every backend; the SQL schema enforces the same
/// pairs with partial unique indexes.
pub fn dedup_conflict(existing: &LedgerEntry, incoming: &LedgerEntry) -> Option<CustodyError> {
    if existing.kind != incoming.kind {
        return None;
    }

    let same_wallet =
        existing.trader_id == incoming.trader_id && existing.currency == incoming.currency;

    match incoming.kind {
        EntryKind::Deposit if same_wallet && existing.tx_hash == incoming.tx_hash => Some(
            CustodyError::DuplicateEvent(format!(
                "deposit {} already credited",
                incoming.tx_hash.as_deref().unwrap_or_default()
            )),
        ),
        EntryKind::Freeze if same_wallet && existing.order_id == incoming.order_id => Some(
            CustodyError::DuplicateEvent(format!(
                "order {} already frozen",
                incoming.order_id.as_deref().unwrap_or_default()
            )),
        ),
        EntryKind::Release if same_wallet && existing.order_id == incoming.order_id => {
            Some(CustodyError::AlreadyReleased {
                order_id: incoming.order_id.clone().unwrap_or_default(),
            })
        }
        EntryKind::Withdraw if existing.tx_hash == incoming.tx_hash => Some(
            CustodyError::DuplicateEvent(format!(
                "withdrawal {} already recorded",
                incoming.tx_hash.as_deref().unwrap_or_default()
            )),
        ),
        _ => None,
    }
}
