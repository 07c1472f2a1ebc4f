//! Signature Relay Client
//!
//! The relay is a dumb, append-only store the stakeholders use to exchange
//! signatures: `PUT (txid, slot) -> sig` and `GET (txid, slot)`. It performs
//! no validation whatsoever; correctness is entirely established locally by
//! verifying every fetched signature against the expected public key and
//! sighash (see `coordinator`).
//!
//! The relay also serves the feerates used for the revocation transactions,
//! cached per `(urgency, txid)`, so that every stakeholder builds the exact
//! same chain for a deposit.

use async_trait::async_trait;
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Relay client errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),

    #[error("feerate unavailable for {0}")]
    NoFeerate(String),

    #[error("unexpected relay response: {0}")]
    BadResponse(String),
}

/// Confirmation-urgency class a feerate is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeerateUrgency {
    /// Revocation to the cold address; must confirm as fast as possible.
    Emergency,
    /// Revocation of an in-flight unvault; must outbid the spend path.
    Cancel,
}

impl FeerateUrgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::Cancel => "cancel",
        }
    }
}

/// Client-side interface to the signature relay.
#[async_trait]
pub trait SignatureRelay: Send + Sync {
    /// Store our signature for `(txid, slot)`. Create-or-overwrite,
    /// idempotent.
    async fn put_signature(&self, txid: &Txid, slot: usize, sig: &[u8]) -> Result<(), RelayError>;

    /// Fetch the signature for `(txid, slot)`, if any was submitted.
    async fn get_signature(&self, txid: &Txid, slot: usize) -> Result<Option<Vec<u8>>, RelayError>;

    /// Feerate in sat/vbyte for an urgency class, stable per `(urgency, txid)`.
    async fn get_feerate(&self, urgency: FeerateUrgency, txid: &Txid) -> Result<u64, RelayError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SigPayload {
    sig: String,
}

#[derive(Debug, Deserialize)]
struct FeeratePayload {
    feerate_vb: u64,
}

/// HTTP client for the signature relay.
///
/// Routes: `POST/GET sig/{txid}/{slot}` and `GET feerate/{urgency}/{txid}`.
/// Transient transport failures are retried with a short backoff; the caller
/// polls again on the next cycle anyway, so the retry budget is small.
#[derive(Debug, Clone)]
pub struct HttpRelay {
    client: reqwest::Client,
    base_url: String,
}

const RETRY_ATTEMPTS: u32 = 3;

impl HttpRelay {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, RelayError> {
        let mut last_err = None;
        for attempt in 1..=RETRY_ATTEMPTS {
            match self.client.get(url).send().await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    tracing::debug!(
                        target: "covault::relay",
                        "GET {} failed (attempt {}/{}): {}",
                        url, attempt, RETRY_ATTEMPTS, e
                    );
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
            }
        }
        Err(RelayError::Unreachable(last_err.expect("at least one attempt")))
    }
}

#[async_trait]
impl SignatureRelay for HttpRelay {
    async fn put_signature(&self, txid: &Txid, slot: usize, sig: &[u8]) -> Result<(), RelayError> {
        let url = format!("{}/sig/{}/{}", self.base_url, txid, slot);
        let payload = SigPayload {
            sig: hex::encode(sig),
        };
        let resp = self.client.post(&url).json(&payload).send().await?;
        if !resp.status().is_success() {
            return Err(RelayError::BadResponse(format!(
                "PUT sig returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn get_signature(&self, txid: &Txid, slot: usize) -> Result<Option<Vec<u8>>, RelayError> {
        let url = format!("{}/sig/{}/{}", self.base_url, txid, slot);
        let resp = self.get_with_retry(&url).await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(RelayError::BadResponse(format!(
                "GET sig returned {}",
                resp.status()
            )));
        }
        let payload: SigPayload = resp.json().await?;
        let sig = hex::decode(&payload.sig)
            .map_err(|e| RelayError::BadResponse(format!("sig is not hex: {}", e)))?;
        Ok(Some(sig))
    }

    async fn get_feerate(&self, urgency: FeerateUrgency, txid: &Txid) -> Result<u64, RelayError> {
        let url = format!("{}/feerate/{}/{}", self.base_url, urgency.as_str(), txid);
        let resp = self.get_with_retry(&url).await?;
        if !resp.status().is_success() {
            return Err(RelayError::NoFeerate(format!(
                "{}/{}",
                urgency.as_str(),
                txid
            )));
        }
        let payload: FeeratePayload = resp.json().await?;
        Ok(payload.feerate_vb)
    }
}

/// In-memory relay, shared between services via `Arc`.
///
/// Behaves exactly like the HTTP relay from the coordinator's point of view:
/// a dumb keyed store plus a deterministic feerate table. Used by the tests
/// to run several stakeholder processes against one relay, and by the demo
/// mode.
#[derive(Debug)]
pub struct MemoryRelay {
    sigs: Mutex<HashMap<(Txid, usize), Vec<u8>>>,
    feerates: HashMap<FeerateUrgency, u64>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::with_feerates(22, 24)
    }

    pub fn with_feerates(emergency: u64, cancel: u64) -> Self {
        let mut feerates = HashMap::new();
        feerates.insert(FeerateUrgency::Emergency, emergency);
        feerates.insert(FeerateUrgency::Cancel, cancel);
        Self {
            sigs: Mutex::new(HashMap::new()),
            feerates,
        }
    }

    pub fn configured_feerate(&self, urgency: FeerateUrgency) -> u64 {
        self.feerates[&urgency]
    }

    /// Number of stored signatures, across all transactions.
    pub fn stored_count(&self) -> usize {
        self.sigs.lock().expect("relay lock poisoned").len()
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignatureRelay for MemoryRelay {
    async fn put_signature(&self, txid: &Txid, slot: usize, sig: &[u8]) -> Result<(), RelayError> {
        self.sigs
            .lock()
            .expect("relay lock poisoned")
            .insert((*txid, slot), sig.to_vec());
        Ok(())
    }

    async fn get_signature(&self, txid: &Txid, slot: usize) -> Result<Option<Vec<u8>>, RelayError> {
        Ok(self
            .sigs
            .lock()
            .expect("relay lock poisoned")
            .get(&(*txid, slot))
            .cloned())
    }

    async fn get_feerate(&self, urgency: FeerateUrgency, _txid: &Txid) -> Result<u64, RelayError> {
        self.feerates
            .get(&urgency)
            .copied()
            .ok_or_else(|| RelayError::NoFeerate(urgency.as_str().to_string()))
    }
}
