//! Chain Backend Interface
//!
//! The daemon consumes the chain through a narrow interface: confirmed UTXOs
//! at watched addresses, spend lookups for known outpoints, raw transaction
//! broadcast and the tip height. The default implementation polls an Esplora
//! HTTP API; tests substitute their own backend.

use async_trait::async_trait;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{Address, Amount, OutPoint, Transaction, Txid};
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use std::str::FromStr;
use thiserror::Error;

/// Chain backend errors
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("backend unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),

    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),

    #[error("unexpected backend response: {0}")]
    BadResponse(String),
}

/// A confirmed unspent output at a watched address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub confirmations: u32,
}

/// A transaction observed spending a watched outpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendInfo {
    pub spending_txid: Txid,
    pub confirmed: bool,
}

/// What the vault engine needs from the chain.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChainBackend: Send + Sync {
    /// Confirmed UTXOs paying to an address.
    async fn confirmed_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ChainError>;

    /// The transaction spending an outpoint, if any has been seen.
    async fn spend_of(&self, outpoint: &OutPoint) -> Result<Option<SpendInfo>, ChainError>;

    /// Broadcast a raw transaction.
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError>;

    /// Current chain tip height.
    async fn tip_height(&self) -> Result<u64, ChainError>;
}

// Esplora API response types.

#[derive(Debug, Deserialize)]
struct EsploraTxStatus {
    confirmed: bool,
    block_height: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    value: u64,
    status: EsploraTxStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraOutspend {
    spent: bool,
    txid: Option<String>,
    status: Option<EsploraTxStatus>,
}

/// Esplora-backed chain client.
#[derive(Debug, Clone)]
pub struct EsploraBackend {
    client: reqwest::Client,
    base_url: String,
}

impl EsploraBackend {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ChainBackend for EsploraBackend {
    async fn confirmed_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ChainError> {
        let url = format!("{}/address/{}/utxo", self.base_url, address);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ChainError::BadResponse(format!(
                "GET utxo returned {}",
                resp.status()
            )));
        }
        let raw: Vec<EsploraUtxo> = resp.json().await?;
        let tip = self.tip_height().await?;

        let mut utxos = Vec::new();
        for u in raw {
            if !u.status.confirmed {
                continue;
            }
            let txid = Txid::from_str(&u.txid)
                .map_err(|e| ChainError::BadResponse(format!("bad txid: {}", e)))?;
            let confirmations = u
                .status
                .block_height
                .map(|h| (tip.saturating_sub(h) + 1) as u32)
                .unwrap_or(1);
            utxos.push(Utxo {
                outpoint: OutPoint::new(txid, u.vout),
                value: Amount::from_sat(u.value),
                confirmations,
            });
        }
        Ok(utxos)
    }

    async fn spend_of(&self, outpoint: &OutPoint) -> Result<Option<SpendInfo>, ChainError> {
        let url = format!(
            "{}/tx/{}/outspend/{}",
            self.base_url, outpoint.txid, outpoint.vout
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ChainError::BadResponse(format!(
                "GET outspend returned {}",
                resp.status()
            )));
        }
        let outspend: EsploraOutspend = resp.json().await?;
        if !outspend.spent {
            return Ok(None);
        }
        let txid = outspend
            .txid
            .ok_or_else(|| ChainError::BadResponse("spent without txid".into()))?;
        let spending_txid = Txid::from_str(&txid)
            .map_err(|e| ChainError::BadResponse(format!("bad txid: {}", e)))?;
        Ok(Some(SpendInfo {
            spending_txid,
            confirmed: outspend.status.map(|s| s.confirmed).unwrap_or(false),
        }))
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        let url = format!("{}/tx", self.base_url);
        let resp = self
            .client
            .post(&url)
            .body(serialize_hex(tx))
            .send()
            .await?;
        if !resp.status().is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(ChainError::BroadcastRejected(error_text));
        }
        let txid = resp.text().await?;
        Txid::from_str(txid.trim())
            .map_err(|e| ChainError::BadResponse(format!("bad txid: {}", e)))
    }

    async fn tip_height(&self) -> Result<u64, ChainError> {
        let url = format!("{}/blocks/tip/height", self.base_url);
        let resp = self.client.get(&url).send().await?;
        resp.text()
            .await?
            .trim()
            .parse()
            .map_err(|e| ChainError::BadResponse(format!("bad height: {}", e)))
    }
}
