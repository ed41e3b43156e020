use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The only currency the custody service settles today
pub const BTC: &str = "BTC";

/// Permanent mapping of a trader to its HD derivation index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraderIndex {
    pub trader_id: String,
    pub hd_index: u32,
}

/// Key identifying one wallet row
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WalletKey {
    pub trader_id: String,
    pub currency: String,
}

impl WalletKey {
    pub fn new(trader_id: &str, currency: &str) -> Self {
        Self {
            trader_id: trader_id.to_string(),
            currency: currency.to_string(),
        }
    }
}

impl std::fmt::Display for WalletKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.trader_id, self.currency)
    }
}

/// Spendable and escrow-frozen amounts of a wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balances {
    pub balance: Decimal,
    pub frozen: Decimal,
}

impl Balances {
    pub fn new(balance: Decimal, frozen: Decimal) -> Self {
        Self { balance, frozen }
    }

    pub fn is_valid(&self) -> bool {
        self.balance >= Decimal::ZERO && self.frozen >= Decimal::ZERO
    }

    pub fn total(&self) -> Decimal {
        self.balance + self.frozen
    }
}

/// Per-trader, per-currency custody wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub trader_id: String,
    pub currency: String,
    /// Deposit address derived from the trader's HD index; never changes
    pub address: String,
    pub balance: Decimal,
    pub frozen: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(trader_id: &str, currency: &str, address: String) -> Self {
        let now = Utc::now();
        Self {
            trader_id: trader_id.to_string(),
            currency: currency.to_string(),
            address,
            balance: Decimal::ZERO,
            frozen: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> WalletKey {
        WalletKey::new(&self.trader_id, &self.currency)
    }

    pub fn balances(&self) -> Balances {
        Balances::new(self.balance, self.frozen)
    }
}
