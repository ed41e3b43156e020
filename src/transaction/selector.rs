use crate::chain::Utxo;
use crate::error::{CustodyError, Result};

/// Inputs picked for one spend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<Utxo>,
    pub total_input: u64,
}

/// First-fit coin selection.
///
/// Walks the UTXOs in the order the provider listed them and stops as soon as
/// `target + fee` is covered. Later outputs are never considered, even if a
/// single one of them would have been a better fit.
#[derive(Debug, Clone, Copy, Default)]
pub struct UtxoSelector;

impl UtxoSelector {
    pub fn select(utxos: &[Utxo], target_sats: u64, fee_sats: u64) -> Result<Selection> {
        let need = target_sats
            .checked_add(fee_sats)
            .ok_or_else(|| CustodyError::InvalidInput("target plus fee overflows".to_string()))?;

        let mut inputs = Vec::new();
        let mut total_input: u64 = 0;

        for utxo in utxos {
            inputs.push(utxo.clone());
            total_input = total_input.saturating_add(utxo.value_sats);
            if total_input >= need {
                return Ok(Selection { inputs, total_input });
            }
        }

        Err(CustodyError::InsufficientUtxo {
            need,
            have: total_input,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(n: u8, value_sats: u64) -> Utxo {
        Utxo {
            txid: format!("{:02x}", n).repeat(32),
            vout: 0,
            value_sats,
        }
    }

    #[test]
    fn test_first_fit_in_listing_order() {
        let utxos = vec![utxo(1, 300_000), utxo(2, 800_000), utxo(3, 5_000_000)];
        let selection = UtxoSelector::select(&utxos, 1_000_000, 1_000).unwrap();

        // Stops at the second coin; the large third one is never touched
        assert_eq!(selection.inputs, utxos[..2].to_vec());
        assert_eq!(selection.total_input, 1_100_000);
    }

    #[test]
    fn test_single_coin_enough() {
        let utxos = vec![utxo(1, 2_000_000), utxo(2, 10)];
        let selection = UtxoSelector::select(&utxos, 1_000_000, 1_000).unwrap();
        assert_eq!(selection.inputs.len(), 1);
    }

    #[test]
    fn test_exact_cover_is_sufficient() {
        let utxos = vec![utxo(1, 600_000), utxo(2, 401_000)];
        let selection = UtxoSelector::select(&utxos, 1_000_000, 1_000).unwrap();
        assert_eq!(selection.total_input, 1_001_000);
    }

    #[test]
    fn test_insufficient_reports_need_and_have() {
        let utxos = vec![utxo(1, 400_000), utxo(2, 500_000)];
        let err = UtxoSelector::select(&utxos, 1_000_000, 1_000).unwrap_err();
        match err {
            CustodyError::InsufficientUtxo { need, have } => {
                assert_eq!(need, 1_001_000);
                assert_eq!(have, 900_000);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_empty_set() {
        let err = UtxoSelector::select(&[], 1, 1).unwrap_err();
        assert!(matches!(err, CustodyError::InsufficientUtxo { need: 2, have: 0 }));
    }
}
