use bitcoin::consensus::encode::serialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    absolute, transaction, Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Txid, Witness,
};
use std::str::FromStr;
use tracing::debug;

use super::selector::UtxoSelector;
use crate::chain::Utxo;
use crate::config::WithdrawalConfig;
use crate::error::{CustodyError, Result};
use crate::signing::DerivedKey;

/// Signed transaction ready for broadcast
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    pub txid: String,
    pub hex: String,
    pub inputs: Vec<Utxo>,
    pub total_input: u64,
    /// Zero when the remainder was at or below the dust threshold
    pub change_sats: u64,
    /// Everything not paid out: the fixed fee plus any forfeited dust
    pub fee_paid: u64,
}

/// Builds and signs P2WPKH spends from a custody address
#[derive(Clone)]
pub struct TransactionBuilder {
    fee_sats: u64,
    dust_threshold_sats: u64,
    secp: Secp256k1<All>,
}

impl TransactionBuilder {
    pub fn new(fee_sats: u64, dust_threshold_sats: u64) -> Self {
        Self {
            fee_sats,
            dust_threshold_sats,
            secp: Secp256k1::new(),
        }
    }

    pub fn from_config(config: &WithdrawalConfig) -> Self {
        Self::new(config.fee_sats, config.dust_threshold_sats)
    }

    pub fn fee_sats(&self) -> u64 {
        self.fee_sats
    }

    pub fn dust_threshold_sats(&self) -> u64 {
        self.dust_threshold_sats
    }

    /// Pay `amount_sats` to `to` from the key's address, returning change there.
    ///
    /// `utxos` must belong to `key.address`; they are selected first-fit in the
    /// order given.
    pub fn build(
        &self,
        key: &DerivedKey,
        utxos: &[Utxo],
        to: &Address,
        amount_sats: u64,
    ) -> Result<BuiltTransaction> {
        if amount_sats == 0 {
            return Err(CustodyError::InvalidInput("amount must be positive".to_string()));
        }

        let selection = UtxoSelector::select(utxos, amount_sats, self.fee_sats)?;
        let change_sats = selection.total_input - amount_sats - self.fee_sats;
        let change_sats = if change_sats > self.dust_threshold_sats {
            change_sats
        } else {
            0
        };

        let input = selection
            .inputs
            .iter()
            .map(|utxo| {
                let txid = Txid::from_str(&utxo.txid).map_err(|e| {
                    CustodyError::ExternalService(format!("invalid utxo txid {}: {}", utxo.txid, e))
                })?;
                Ok(TxIn {
                    previous_output: OutPoint::new(txid, utxo.vout),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let own_script = key.address.script_pubkey();
        let mut output = vec![TxOut {
            value: Amount::from_sat(amount_sats),
            script_pubkey: to.script_pubkey(),
        }];
        if change_sats > 0 {
            output.push(TxOut {
                value: Amount::from_sat(change_sats),
                script_pubkey: own_script.clone(),
            });
        }

        let mut tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input,
            output,
        };

        let witnesses = {
            let mut cache = SighashCache::new(&tx);
            let mut witnesses = Vec::with_capacity(selection.inputs.len());
            for (i, utxo) in selection.inputs.iter().enumerate() {
                let sighash = cache
                    .p2wpkh_signature_hash(
                        i,
                        &own_script,
                        Amount::from_sat(utxo.value_sats),
                        EcdsaSighashType::All,
                    )
                    .map_err(|e| CustodyError::Internal(format!("sighash for input {i}: {e}")))?;

                let msg = Message::from_digest(sighash.to_byte_array());
                let signature = bitcoin::ecdsa::Signature {
                    signature: self.secp.sign_ecdsa(&msg, key.secret_key()),
                    sighash_type: EcdsaSighashType::All,
                };
                witnesses.push(Witness::p2wpkh(&signature, &key.public_key.0));
            }
            witnesses
        };

        for (txin, witness) in tx.input.iter_mut().zip(witnesses) {
            txin.witness = witness;
        }

        let txid = tx.compute_txid().to_string();
        debug!(
            "Built {} with {} inputs, change {} sat",
            txid,
            tx.input.len(),
            change_sats
        );

        Ok(BuiltTransaction {
            txid,
            hex: serialize_hex(&tx),
            fee_paid: selection.total_input - amount_sats - change_sats,
            inputs: selection.inputs,
            total_input: selection.total_input,
            change_sats,
        })
    }
}
