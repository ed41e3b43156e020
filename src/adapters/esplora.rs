//! Esplora REST adapter (mempool.space / blockstream.info compatible).

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::chain::{AddressTx, Broadcaster, ChainStatusProvider, TxOutput, TxStatus, Utxo, UtxoProvider};
use crate::error::{CustodyError, Result};

/// Confirmed transactions returned per `/txs/chain` page
const CHAIN_PAGE_SIZE: usize = 25;

#[derive(Debug, Deserialize)]
struct EsploraStatus {
    confirmed: bool,
    #[serde(default)]
    block_height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraPrevout {
    #[serde(default)]
    scriptpubkey_address: Option<String>,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraVin {
    #[serde(default)]
    prevout: Option<EsploraPrevout>,
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    txid: String,
    #[serde(default)]
    vin: Vec<EsploraVin>,
    #[serde(default)]
    vout: Vec<EsploraPrevout>,
    status: EsploraStatus,
}

#[derive(Debug, Deserialize)]
struct ChainStats {
    tx_count: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraAddress {
    chain_stats: ChainStats,
}

impl From<EsploraPrevout> for TxOutput {
    fn from(out: EsploraPrevout) -> Self {
        TxOutput {
            address: out.scriptpubkey_address,
            value_sats: out.value,
        }
    }
}

impl From<EsploraTx> for AddressTx {
    fn from(tx: EsploraTx) -> Self {
        AddressTx {
            txid: tx.txid,
            confirmed: tx.status.confirmed,
            inputs: tx
                .vin
                .into_iter()
                .filter_map(|vin| vin.prevout)
                .map(TxOutput::from)
                .collect(),
            outputs: tx.vout.into_iter().map(TxOutput::from).collect(),
        }
    }
}

#[derive(Clone)]
pub struct EsploraClient {
    http: Client,
    base_url: String,
    max_pages: u32,
}

impl EsploraClient {
    pub fn new(base_url: &str, timeout: Duration, max_pages: u32) -> Result<Self> {
        let http = Client::builder()
            .user_agent("custodian/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| CustodyError::Internal(format!("failed to build Esplora HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_pages: max_pages.max(1),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET a JSON document; `None` on 404
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let text = resp.text().await?;
        if !status.is_success() {
            return Err(CustodyError::ExternalService(format!(
                "Esplora GET {} failed: status={} body={}",
                path, status, text
            )));
        }

        serde_json::from_str(&text).map(Some).map_err(|e| {
            CustodyError::ExternalService(format!("invalid Esplora JSON for {}: {}", path, e))
        })
    }

    async fn get_required<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get_json(path)
            .await?
            .ok_or_else(|| CustodyError::ExternalService(format!("Esplora GET {} returned 404", path)))
    }
}

#[async_trait]
impl UtxoProvider for EsploraClient {
    async fn list_unspent(&self, address: &str) -> Result<Vec<Utxo>> {
        let utxos: Vec<EsploraUtxo> = self.get_required(&format!("/address/{}/utxo", address)).await?;
        debug!("{} unspent outputs for {}", utxos.len(), address);

        Ok(utxos
            .into_iter()
            .map(|u| Utxo {
                txid: u.txid,
                vout: u.vout,
                value_sats: u.value,
            })
            .collect())
    }
}

#[async_trait]
impl Broadcaster for EsploraClient {
    async fn submit(&self, signed_tx_hex: &str) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/tx", self.base_url))
            .header(CONTENT_TYPE, "text/plain")
            .body(signed_tx_hex.to_string())
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(CustodyError::Broadcast(format!("status={} body={}", status, text)));
        }

        let txid = text.trim().to_string();
        if txid.is_empty() {
            return Err(CustodyError::Broadcast("empty txid in response".to_string()));
        }
        Ok(txid)
    }
}

#[async_trait]
impl ChainStatusProvider for EsploraClient {
    async fn get_address_txs(&self, address: &str) -> Result<Vec<AddressTx>> {
        let summary: Option<EsploraAddress> = self.get_json(&format!("/address/{}", address)).await?;
        match summary {
            Some(s) if s.chain_stats.tx_count > 0 => {}
            _ => return Ok(Vec::new()),
        }

        // First page: mempool txs plus up to 25 confirmed
        let mut txs: Vec<EsploraTx> = self.get_required(&format!("/address/{}/txs", address)).await?;
        let mut last_page_confirmed = txs.iter().filter(|t| t.status.confirmed).count();
        let mut pages = 1;

        while last_page_confirmed >= CHAIN_PAGE_SIZE && pages < self.max_pages {
            let Some(last_txid) = txs.iter().rev().find(|t| t.status.confirmed).map(|t| t.txid.clone()) else {
                break;
            };

            let page: Vec<EsploraTx> = self
                .get_required(&format!("/address/{}/txs/chain/{}", address, last_txid))
                .await?;
            last_page_confirmed = page.len();
            pages += 1;
            txs.extend(page);
        }

        if last_page_confirmed >= CHAIN_PAGE_SIZE {
            warn!(
                "History of {} truncated after {} pages; older deposits not scanned",
                address, pages
            );
        }

        Ok(txs.into_iter().map(AddressTx::from).collect())
    }

    async fn get_tx(&self, txid: &str) -> Result<Option<TxStatus>> {
        let tx: Option<EsploraTx> = self.get_json(&format!("/tx/{}", txid)).await?;
        Ok(tx.map(|t| TxStatus {
            confirmed: t.status.confirmed,
            block_height: t.status.block_height,
        }))
    }
}
