use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of ledger movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Deposit,
    Freeze,
    Release,
    Reward,
    Withdraw,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Deposit => "deposit",
            EntryKind::Freeze => "freeze",
            EntryKind::Release => "release",
            EntryKind::Reward => "reward",
            EntryKind::Withdraw => "withdraw",
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for EntryKind {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s {
            "deposit" => Ok(EntryKind::Deposit),
            "freeze" => Ok(EntryKind::Freeze),
            "release" => Ok(EntryKind::Release),
            "reward" => Ok(EntryKind::Reward),
            "withdraw" => Ok(EntryKind::Withdraw),
            other => Err(format!("unknown entry kind: {other}")),
        }
    }
}

/// Entry status; only `pending -> confirmed` is ever allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Confirmed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Confirmed => "confirmed",
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for EntryStatus {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "confirmed" => Ok(EntryStatus::Confirmed),
            other => Err(format!("unknown entry status: {other}")),
        }
    }
}

/// Append-only ledger record (a wallet transaction)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub trader_id: String,
    pub currency: String,
    pub kind: EntryKind,
    pub amount: Decimal,
    pub status: EntryStatus,
    /// Correlates a freeze with its release (and reward)
    pub order_id: Option<String>,
    /// On-chain txid: deposit dedup key, withdraw confirmation key
    pub tx_hash: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        trader_id: &str,
        currency: &str,
        kind: EntryKind,
        amount: Decimal,
        status: EntryStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            trader_id: trader_id.to_string(),
            currency: currency.to_string(),
            kind,
            amount,
            status,
            order_id: None,
            tx_hash: None,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_order_id(mut self, order_id: &str) -> Self {
        self.order_id = Some(order_id.to_string());
        self
    }

    pub fn with_tx_hash(mut self, tx_hash: &str) -> Self {
        self.tx_hash = Some(tx_hash.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == EntryStatus::Pending
    }
}

/// Lookup key for the correlation columns of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryRef<'a> {
    Order(&'a str),
    Tx(&'a str),
}

impl LedgerEntry {
    pub fn matches(&self, kind: EntryKind, reference: EntryRef<'_>) -> bool {
        self.kind == kind
            && match reference {
                EntryRef::Order(order_id) => self.order_id.as_deref() == Some(order_id),
                EntryRef::Tx(tx_hash) => self.tx_hash.as_deref() == Some(tx_hash),
            }
    }
}
