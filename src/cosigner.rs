//! Cosigner Client
//!
//! The cosigner is an independent party whose signature is required on every
//! Spend, enforcing spend policy. It is only ever given the negotiation
//! parameters; it reconstructs the Spend on its side, validates it, and
//! returns a signature or a rejection. A well-behaved cosigner signs at most
//! once per vault, so a compromised manager cannot get two conflicting
//! spends authorized.

use async_trait::async_trait;
use bitcoin::bip32::Xpriv;
use bitcoin::{Amount, Network, OutPoint, ScriptBuf};
use secp256k1::SECP256K1;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;

use crate::coordinator;
use crate::keychain;
use crate::spend::SpendProposal;
use crate::txchain;

/// Cosigner client errors
#[derive(Debug, Error)]
pub enum CosignerError {
    #[error("cosigner unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),

    #[error("unexpected cosigner response: {0}")]
    BadResponse(String),
}

/// Outcome of a signature request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CosignerResponse {
    /// DER signature over the reconstructed Spend.
    Signature(Vec<u8>),
    /// The cosigner refused, with a reason.
    Rejected(String),
}

/// Client-side interface to the cosigner.
#[async_trait]
pub trait Cosigner: Send + Sync {
    async fn request_spend_signature(
        &self,
        proposal: &SpendProposal,
    ) -> Result<CosignerResponse, CosignerError>;
}

#[derive(Debug, Deserialize)]
struct CosignerPayload {
    sig: Option<String>,
    rejected: Option<String>,
}

/// HTTP client for a remote cosigning server.
#[derive(Debug, Clone)]
pub struct HttpCosigner {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCosigner {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Cosigner for HttpCosigner {
    async fn request_spend_signature(
        &self,
        proposal: &SpendProposal,
    ) -> Result<CosignerResponse, CosignerError> {
        let url = format!("{}/sign", self.base_url);
        let resp = self.client.post(&url).json(proposal).send().await?;
        if !resp.status().is_success() {
            return Err(CosignerError::BadResponse(format!(
                "POST sign returned {}",
                resp.status()
            )));
        }
        let payload: CosignerPayload = resp.json().await?;
        if let Some(reason) = payload.rejected {
            return Ok(CosignerResponse::Rejected(reason));
        }
        let sig = payload
            .sig
            .ok_or_else(|| CosignerError::BadResponse("neither sig nor rejection".into()))?;
        let der = hex::decode(&sig)
            .map_err(|e| CosignerError::BadResponse(format!("sig is not hex: {}", e)))?;
        Ok(CosignerResponse::Signature(der))
    }
}

/// Everything the cosigner needs to rebuild a vault's Spend on its own.
#[derive(Debug, Clone)]
pub struct SpendContext {
    pub unvault_outpoint: OutPoint,
    pub unvault_value: Amount,
    pub unvault_script: ScriptBuf,
    pub derivation_index: u32,
}

/// An in-process cosigner holding its own key, used by the tests and the
/// demo mode. Reconstructs every Spend from the proposal parameters, never
/// trusting the initiator, and signs at most once per vault.
pub struct LocalCosigner {
    xpriv: Xpriv,
    network: Network,
    csv_delay: u16,
    contexts: Mutex<HashMap<OutPoint, SpendContext>>,
    signed: Mutex<HashSet<OutPoint>>,
}

impl LocalCosigner {
    pub fn new(xpriv: Xpriv, network: Network, csv_delay: u16) -> Self {
        Self {
            xpriv,
            network,
            csv_delay,
            contexts: Mutex::new(HashMap::new()),
            signed: Mutex::new(HashSet::new()),
        }
    }

    /// Register a vault this cosigner may be asked to authorize, keyed by
    /// deposit outpoint.
    pub fn register_vault(&self, deposit_outpoint: OutPoint, context: SpendContext) {
        self.contexts
            .lock()
            .expect("cosigner lock poisoned")
            .insert(deposit_outpoint, context);
    }
}

#[async_trait]
impl Cosigner for LocalCosigner {
    async fn request_spend_signature(
        &self,
        proposal: &SpendProposal,
    ) -> Result<CosignerResponse, CosignerError> {
        let context = {
            let contexts = self.contexts.lock().expect("cosigner lock poisoned");
            match contexts.get(&proposal.deposit_outpoint) {
                Some(c) => c.clone(),
                None => return Ok(CosignerResponse::Rejected("unknown vault".into())),
            }
        };

        use std::str::FromStr;
        let destination = match bitcoin::Address::from_str(&proposal.destination)
            .map_err(|e| e.to_string())
            .and_then(|a| a.require_network(self.network).map_err(|e| e.to_string()))
        {
            Ok(a) => a,
            Err(e) => return Ok(CosignerResponse::Rejected(format!("bad destination: {}", e))),
        };

        let reconstructed = match txchain::build_spend(
            context.unvault_outpoint,
            context.unvault_value,
            &context.unvault_script,
            &destination,
            Amount::from_sat(proposal.amount),
            self.csv_delay,
        ) {
            Ok(tx) => tx,
            Err(e) => return Ok(CosignerResponse::Rejected(e.to_string())),
        };

        if reconstructed.txid() != proposal.spend_txid {
            return Ok(CosignerResponse::Rejected(format!(
                "reconstruction mismatch: {} != {}",
                reconstructed.txid(),
                proposal.spend_txid
            )));
        }

        // One authorization per vault, and only after the proposal checked
        // out; a rejected proposal does not burn the slot.
        if !self
            .signed
            .lock()
            .expect("cosigner lock poisoned")
            .insert(proposal.deposit_outpoint)
        {
            return Ok(CosignerResponse::Rejected("already signed".into()));
        }

        let msg = match coordinator::sighash_message(&reconstructed) {
            Ok(m) => m,
            Err(e) => return Ok(CosignerResponse::Rejected(e.to_string())),
        };
        let privkey = match keychain::derive_privkey(&self.xpriv, context.derivation_index) {
            Ok(k) => k,
            Err(e) => return Ok(CosignerResponse::Rejected(e.to_string())),
        };
        let sig = SECP256K1.sign_ecdsa(&msg, &privkey);
        Ok(CosignerResponse::Signature(sig.serialize_der().to_vec()))
    }
}
