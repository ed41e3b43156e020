#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::bip32::Xpriv;
use bitcoin::consensus::encode::deserialize_hex;
use bitcoin::{Network, Transaction};
use custodian::chain::{
    AddressTx, Broadcaster, ChainStatusProvider, TxOutput, TxStatus, Utxo, UtxoProvider,
};
use custodian::error::{CustodyError, Result};
use custodian::ledger::Ledger;
use custodian::persistence::MemoryStore;
use custodian::services::WithdrawalService;
use custodian::signing::KeyDerivation;
use custodian::transaction::TransactionBuilder;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Deterministic testnet master key
pub fn keys() -> KeyDerivation {
    let master = Xpriv::new_master(Network::Testnet, &[7u8; 32]).unwrap();
    KeyDerivation::from_xprv(&master.to_string(), Network::Testnet).unwrap()
}

pub fn ledger() -> Arc<Ledger> {
    Arc::new(Ledger::new(Arc::new(MemoryStore::new()), keys()))
}

/// A testnet address no trader owns
pub fn external_address() -> String {
    keys().address(1_000_000).unwrap().to_string()
}

pub fn utxo(n: u8, value_sats: u64) -> Utxo {
    Utxo {
        txid: format!("{:02x}", n).repeat(32),
        vout: 0,
        value_sats,
    }
}

pub fn payment(txid: &str, to: &str, value_sats: u64) -> AddressTx {
    AddressTx {
        txid: txid.to_string(),
        confirmed: true,
        inputs: vec![TxOutput {
            address: Some("tb1qfunder".to_string()),
            value_sats: value_sats + 2_000,
        }],
        outputs: vec![TxOutput {
            address: Some(to.to_string()),
            value_sats,
        }],
    }
}

/// In-memory chain: scripted UTXOs, address history and tx status
#[derive(Default)]
pub struct FakeChain {
    utxos: Mutex<HashMap<String, Vec<Utxo>>>,
    history: Mutex<HashMap<String, Vec<AddressTx>>>,
    statuses: Mutex<HashMap<String, TxStatus>>,
    broadcasts: Mutex<Vec<String>>,
    reject_broadcasts: Mutex<bool>,
}

impl FakeChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_utxos(&self, address: &str, utxos: Vec<Utxo>) {
        self.utxos.lock().unwrap().insert(address.to_string(), utxos);
    }

    pub fn push_tx(&self, address: &str, tx: AddressTx) {
        self.history
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .push(tx);
    }

    pub fn confirm(&self, txid: &str, block_height: u32) {
        self.statuses.lock().unwrap().insert(
            txid.to_string(),
            TxStatus {
                confirmed: true,
                block_height: Some(block_height),
            },
        );
    }

    pub fn reject_broadcasts(&self) {
        *self.reject_broadcasts.lock().unwrap() = true;
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.broadcasts.lock().unwrap().clone()
    }
}

#[async_trait]
impl UtxoProvider for FakeChain {
    async fn list_unspent(&self, address: &str) -> Result<Vec<Utxo>> {
        Ok(self
            .utxos
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl Broadcaster for FakeChain {
    async fn submit(&self, signed_tx_hex: &str) -> Result<String> {
        if *self.reject_broadcasts.lock().unwrap() {
            return Err(CustodyError::Broadcast("rejected by fake node".to_string()));
        }
        let tx: Transaction = deserialize_hex(signed_tx_hex)
            .map_err(|e| CustodyError::Broadcast(e.to_string()))?;
        let txid = tx.compute_txid().to_string();
        self.broadcasts.lock().unwrap().push(txid.clone());
        Ok(txid)
    }
}

#[async_trait]
impl ChainStatusProvider for FakeChain {
    async fn get_address_txs(&self, address: &str) -> Result<Vec<AddressTx>> {
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_tx(&self, txid: &str) -> Result<Option<TxStatus>> {
        Ok(self.statuses.lock().unwrap().get(txid).copied())
    }
}

pub fn withdrawal_service(ledger: Arc<Ledger>, chain: Arc<FakeChain>) -> WithdrawalService {
    WithdrawalService::new(
        ledger,
        keys(),
        TransactionBuilder::new(1_000, 500),
        chain.clone(),
        chain,
        Duration::from_secs(5),
    )
}
