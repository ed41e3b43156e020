use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Spendable output of a custody address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value_sats: u64,
}

/// One side of a transaction as seen by the chain provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// `None` for scripts without an address form (e.g. OP_RETURN)
    pub address: Option<String>,
    pub value_sats: u64,
}

/// Transaction touching a watched address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressTx {
    pub txid: String,
    pub confirmed: bool,
    /// Previous outputs spent by this transaction
    pub inputs: Vec<TxOutput>,
    pub outputs: Vec<TxOutput>,
}

impl AddressTx {
    /// Total value this transaction pays to `address`
    pub fn paid_to(&self, address: &str) -> u64 {
        self.outputs
            .iter()
            .filter(|o| o.address.as_deref() == Some(address))
            .map(|o| o.value_sats)
            .sum()
    }

    /// True when `address` funds this transaction (our own withdrawal and its change)
    pub fn spends_from(&self, address: &str) -> bool {
        self.inputs
            .iter()
            .any(|i| i.address.as_deref() == Some(address))
    }
}

/// Confirmation status of a single transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    pub block_height: Option<u32>,
}

/// Lists spendable outputs, in the provider's own order
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UtxoProvider: Send + Sync {
    async fn list_unspent(&self, address: &str) -> Result<Vec<Utxo>>;
}

/// Submits a signed transaction to the network
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Returns the txid accepted by the network
    async fn submit(&self, signed_tx_hex: &str) -> Result<String>;
}

/// Read access to confirmed chain state
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainStatusProvider: Send + Sync {
    async fn get_address_txs(&self, address: &str) -> Result<Vec<AddressTx>>;

    /// `None` when the provider does not know the transaction (yet)
    async fn get_tx(&self, txid: &str) -> Result<Option<TxStatus>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(address: &str, value_sats: u64) -> TxOutput {
        TxOutput {
            address: Some(address.to_string()),
            value_sats,
        }
    }

    #[test]
    fn test_paid_to_sums_matching_outputs() {
        let tx = AddressTx {
            txid: "txA".to_string(),
            confirmed: true,
            inputs: vec![output("tb1qsender", 9_000_000)],
            outputs: vec![
                output("tb1qwallet", 3_000_000),
                output("tb1qother", 1_000_000),
                output("tb1qwallet", 2_000_000),
                TxOutput {
                    address: None,
                    value_sats: 0,
                },
            ],
        };

        assert_eq!(tx.paid_to("tb1qwallet"), 5_000_000);
        assert_eq!(tx.paid_to("tb1qnobody"), 0);
        assert!(!tx.spends_from("tb1qwallet"));
        assert!(tx.spends_from("tb1qsender"));
    }
}
