use bitcoin::address::NetworkUnchecked;
use bitcoin::Address;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use super::bounded;
use crate::chain::{Broadcaster, UtxoProvider};
use crate::domain::{btc_to_sats, validate_amount, LedgerEntry, BTC};
use crate::error::{CustodyError, Result};
use crate::ledger::Ledger;
use crate::signing::KeyDerivation;
use crate::transaction::TransactionBuilder;

/// Result of a completed withdrawal
#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalReceipt {
    pub txid: String,
    pub amount: Decimal,
    pub fee_sats: u64,
    pub change_sats: u64,
    pub entry: LedgerEntry,
}

/// Sends BTC out of custody.
///
/// Sequence: reserve funds, sign, broadcast, then debit. Anything failing
/// before the broadcast leaves the ledger as it was.
pub struct WithdrawalService {
    ledger: Arc<Ledger>,
    keys: KeyDerivation,
    builder: TransactionBuilder,
    utxos: Arc<dyn UtxoProvider>,
    broadcaster: Arc<dyn Broadcaster>,
    call_timeout: Duration,
}

impl WithdrawalService {
    pub fn new(
        ledger: Arc<Ledger>,
        keys: KeyDerivation,
        builder: TransactionBuilder,
        utxos: Arc<dyn UtxoProvider>,
        broadcaster: Arc<dyn Broadcaster>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            keys,
            builder,
            utxos,
            broadcaster,
            call_timeout,
        }
    }

    fn parse_destination(&self, to_address: &str) -> Result<Address> {
        let unchecked: Address<NetworkUnchecked> = to_address
            .trim()
            .parse()
            .map_err(|e| CustodyError::InvalidInput(format!("invalid address {to_address}: {e}")))?;

        unchecked.require_network(self.keys.network()).map_err(|e| {
            CustodyError::InvalidInput(format!(
                "address {to_address} is not valid on {}: {e}",
                self.keys.network()
            ))
        })
    }

    #[instrument(skip(self))]
    pub async fn withdraw(
        &self,
        trader_id: &str,
        to_address: &str,
        amount: Decimal,
    ) -> Result<WithdrawalReceipt> {
        if trader_id.trim().is_empty() || to_address.trim().is_empty() {
            return Err(CustodyError::InvalidInput(
                "trader_id and to_address are required".to_string(),
            ));
        }
        let amount = validate_amount(amount)?;
        let amount_sats = btc_to_sats(amount)?;
        if amount_sats < self.builder.dust_threshold_sats() {
            return Err(CustodyError::InvalidInput(format!(
                "amount {} sat is below the dust threshold of {} sat",
                amount_sats,
                self.builder.dust_threshold_sats()
            )));
        }
        let destination = self.parse_destination(to_address)?;

        let reservation = self.ledger.begin_withdraw(trader_id, BTC, amount).await?;
        let index = self
            .ledger
            .indices()
            .lookup(trader_id)
            .await?
            .ok_or_else(|| CustodyError::NotFound(format!("derivation index for {trader_id}")))?;

        let built = {
            let key = self.keys.derive(index)?;
            if key.address.to_string() != reservation.address() {
                return Err(CustodyError::Internal(format!(
                    "index {} derives {} but wallet {} holds {}",
                    index,
                    key.address,
                    reservation.key(),
                    reservation.address()
                )));
            }

            let utxos = bounded(
                self.call_timeout,
                "list_unspent",
                self.utxos.list_unspent(reservation.address()),
            )
            .await?;

            self.builder.build(&key, &utxos, &destination, amount_sats)?
        };

        info!(
            "Broadcasting withdrawal {} for {}: {} sat to {} ({} inputs, change {} sat)",
            built.txid,
            trader_id,
            amount_sats,
            destination,
            built.inputs.len(),
            built.change_sats
        );

        let txid = bounded(
            self.call_timeout,
            "broadcast",
            self.broadcaster.submit(&built.hex),
        )
        .await?;
        if txid != built.txid {
            warn!("Broadcaster returned txid {} for locally built {}", txid, built.txid);
        }

        let entry = match self.ledger.commit_withdraw(reservation, &txid).await {
            Ok(entry) => entry,
            Err(e) => {
                error!(
                    "Withdrawal {} is on the network but the ledger debit for {} failed: {}",
                    txid, trader_id, e
                );
                return Err(e);
            }
        };

        Ok(WithdrawalReceipt {
            txid,
            amount,
            fee_sats: built.fee_paid,
            change_sats: built.change_sats,
            entry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockBroadcaster, MockUtxoProvider, Utxo};
    use crate::domain::EntryKind;
    use crate::persistence::MemoryStore;
    use crate::signing::derivation::tests::test_keys;
    use bitcoin::consensus::encode::deserialize_hex;
    use bitcoin::Transaction;
    use rust_decimal_macros::dec;

    fn utxo(value_sats: u64) -> Utxo {
        Utxo {
            txid: "ab".repeat(32),
            vout: 0,
            value_sats,
        }
    }

    async fn funded_ledger() -> Arc<Ledger> {
        let ledger = Arc::new(Ledger::new(Arc::new(MemoryStore::new()), test_keys()));
        ledger.create_wallet("trader1", BTC).await.unwrap();
        ledger
            .credit_deposit("trader1", BTC, dec!(0.05), "txA")
            .await
            .unwrap();
        ledger
    }

    fn service(ledger: Arc<Ledger>, utxos: MockUtxoProvider, broadcaster: MockBroadcaster) -> WithdrawalService {
        WithdrawalService::new(
            ledger,
            test_keys(),
            TransactionBuilder::new(1_000, 500),
            Arc::new(utxos),
            Arc::new(broadcaster),
            Duration::from_secs(5),
        )
    }

    fn destination() -> String {
        test_keys().address(99).unwrap().to_string()
    }

    #[tokio::test]
    async fn test_successful_withdrawal_debits_after_broadcast() {
        let ledger = funded_ledger().await;

        let mut utxos = MockUtxoProvider::new();
        utxos
            .expect_list_unspent()
            .times(1)
            .returning(|_| Ok(vec![utxo(2_000_000)]));
        let mut broadcaster = MockBroadcaster::new();
        broadcaster.expect_submit().times(1).returning(|hex| {
            let tx: Transaction = deserialize_hex(hex).unwrap();
            Ok(tx.compute_txid().to_string())
        });

        let receipt = service(ledger.clone(), utxos, broadcaster)
            .withdraw("trader1", &destination(), dec!(0.01))
            .await
            .unwrap();

        assert_eq!(receipt.fee_sats, 1_000);
        assert_eq!(receipt.change_sats, 999_000);
        assert_eq!(receipt.entry.kind, EntryKind::Withdraw);
        assert_eq!(receipt.entry.tx_hash.as_deref(), Some(receipt.txid.as_str()));
        assert!(receipt.entry.is_pending());
        assert_eq!(ledger.wallet("trader1", BTC).await.unwrap().balance, dec!(0.04));
    }

    #[tokio::test]
    async fn test_insufficient_utxo_leaves_ledger_unchanged() {
        let ledger = funded_ledger().await;

        let mut utxos = MockUtxoProvider::new();
        utxos
            .expect_list_unspent()
            .returning(|_| Ok(vec![utxo(900_000)]));
        let mut broadcaster = MockBroadcaster::new();
        broadcaster.expect_submit().times(0);

        let err = service(ledger.clone(), utxos, broadcaster)
            .withdraw("trader1", &destination(), dec!(0.01))
            .await
            .unwrap_err();

        assert!(matches!(err, CustodyError::InsufficientUtxo { .. }));
        assert_eq!(ledger.wallet("trader1", BTC).await.unwrap().balance, dec!(0.05));
        assert!(ledger.pending_withdrawals(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_failure_leaves_ledger_unchanged() {
        let ledger = funded_ledger().await;

        let mut utxos = MockUtxoProvider::new();
        utxos
            .expect_list_unspent()
            .returning(|_| Ok(vec![utxo(2_000_000)]));
        let mut broadcaster = MockBroadcaster::new();
        broadcaster
            .expect_submit()
            .returning(|_| Err(CustodyError::Broadcast("bad-txns-inputs-missingorspent".to_string())));

        let err = service(ledger.clone(), utxos, broadcaster)
            .withdraw("trader1", &destination(), dec!(0.01))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(ledger.wallet("trader1", BTC).await.unwrap().balance, dec!(0.05));

        // The reservation was released: the wallet accepts new operations
        ledger.freeze("trader1", BTC, dec!(0.01), "order1").await.unwrap();
    }

    #[tokio::test]
    async fn test_ledger_balance_checked_before_chain() {
        let ledger = funded_ledger().await;

        let mut utxos = MockUtxoProvider::new();
        utxos.expect_list_unspent().times(0);
        let mut broadcaster = MockBroadcaster::new();
        broadcaster.expect_submit().times(0);

        let err = service(ledger, utxos, broadcaster)
            .withdraw("trader1", &destination(), dec!(0.06))
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::InsufficientFunds(_)));
    }

    #[tokio::test]
    async fn test_rejects_bad_destination_and_dust() {
        let ledger = funded_ledger().await;
        let svc = service(ledger, MockUtxoProvider::new(), MockBroadcaster::new());

        // Mainnet address on a testnet service
        let err = svc
            .withdraw("trader1", "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq", dec!(0.01))
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::InvalidInput(_)));

        let err = svc
            .withdraw("trader1", "not-an-address", dec!(0.01))
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::InvalidInput(_)));

        let err = svc
            .withdraw("trader1", &destination(), dec!(0.00000400))
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_unknown_trader() {
        let ledger = Arc::new(Ledger::new(Arc::new(MemoryStore::new()), test_keys()));
        let err = service(ledger, MockUtxoProvider::new(), MockBroadcaster::new())
            .withdraw("ghost", &destination(), dec!(0.01))
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::NotFound(_)));
    }
}
