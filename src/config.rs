//! Environment-based Configuration
//!
//! All configuration comes from environment variables. The stakeholder list,
//! quorum subset and cosigner key are fixed configuration shared by every
//! participant; they are never negotiated or discovered at runtime.
//!
//! # Required Environment Variables
//!
//! - `COVAULT_STAKEHOLDER_XPUBS` - comma-separated xpubs in protocol order,
//!   with the literal `self` marking this process's slot
//! - `COVAULT_XPRIV` - this process's extended private key
//! - `COVAULT_COSIGNER_XPUB` - the cosigner's extended public key
//! - `COVAULT_EMERGENCY_ADDRESS` - the cold emergency destination
//!
//! # Optional Settings
//!
//! - `COVAULT_NETWORK` - "bitcoin", "testnet", "signet", "regtest"
//!   (default: "regtest")
//! - `COVAULT_MANAGERS` - comma-separated stakeholder slots allowed to
//!   initiate spends (default: "0")
//! - `COVAULT_CSV_DELAY` - unvault relative timelock in blocks (default: 6)
//! - `COVAULT_DERIVATION_GAP` - watched-address gap limit (default: 20)
//! - `COVAULT_CANCEL_FEERATE_FACTOR` - cancel fee multiplier (default: 2)
//! - `COVAULT_REQUIRED_CONFIRMATIONS` - deposit confirmation depth (default: 1)
//! - `COVAULT_POLL_INTERVAL_SECS` - polling cadence (default: 10)
//! - `COVAULT_RELAY_URL` / `COVAULT_COSIGNER_URL` / `COVAULT_CHAIN_URL`
//! - `COVAULT_API_PORT` - operator API port (default: 3001)
//! - `COVAULT_LOG_LEVEL` - debug, info, warn, error (default: info)

use std::env;
use std::str::FromStr;

use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::{Address, Network};
use thiserror::Error;

use crate::keychain::{KeyError, StakeholderSet};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("malformed stakeholder set: {0}")]
    Stakeholders(#[from] KeyError),
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct Config {
    /// Bitcoin network
    pub network: Network,

    /// Stakeholder xpubs in protocol order; `None` marks our slot.
    pub stakeholder_xpubs: Vec<Option<Xpub>>,

    /// Our extended private key.
    pub xpriv: Xpriv,

    /// Stakeholder slots allowed to initiate spends.
    pub manager_slots: Vec<usize>,

    /// The cosigner's extended public key.
    pub cosigner_xpub: Xpub,

    /// Cold emergency destination.
    pub emergency_address: Address,

    /// Unvault relative timelock, in blocks.
    pub csv_delay: u16,

    /// Derivation gap limit.
    pub derivation_gap: u32,

    /// Cancel feerate multiplier over the oracle's cancel class.
    pub cancel_feerate_factor: u64,

    /// Confirmations before a deposit is tracked.
    pub required_confirmations: u32,

    /// Polling cadence, in seconds.
    pub poll_interval_secs: u64,

    /// Signature relay endpoint.
    pub relay_url: String,

    /// Cosigning server endpoint.
    pub cosigner_url: String,

    /// Chain backend (Esplora) endpoint.
    pub chain_url: String,

    /// Operator API port.
    pub api_port: u16,

    /// Log level
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let network = parse_network(
            &env::var("COVAULT_NETWORK").unwrap_or_else(|_| "regtest".to_string()),
        )?;

        let xpubs_raw = required("COVAULT_STAKEHOLDER_XPUBS")?;
        let stakeholder_xpubs = parse_xpub_list(&xpubs_raw)?;

        let xpriv = Xpriv::from_str(&required("COVAULT_XPRIV")?)
            .map_err(|e| ConfigError::InvalidValue("COVAULT_XPRIV".into(), e.to_string()))?;

        let cosigner_xpub = Xpub::from_str(&required("COVAULT_COSIGNER_XPUB")?).map_err(|e| {
            ConfigError::InvalidValue("COVAULT_COSIGNER_XPUB".into(), e.to_string())
        })?;

        let emergency_address = Address::from_str(&required("COVAULT_EMERGENCY_ADDRESS")?)
            .map_err(|e| {
                ConfigError::InvalidValue("COVAULT_EMERGENCY_ADDRESS".into(), e.to_string())
            })?
            .require_network(network)
            .map_err(|e| {
                ConfigError::InvalidValue("COVAULT_EMERGENCY_ADDRESS".into(), e.to_string())
            })?;

        let manager_slots = env::var("COVAULT_MANAGERS")
            .unwrap_or_else(|_| "0".to_string())
            .split(',')
            .map(|s| {
                s.trim().parse::<usize>().map_err(|_| {
                    ConfigError::InvalidValue("COVAULT_MANAGERS".into(), s.to_string())
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            network,
            stakeholder_xpubs,
            xpriv,
            manager_slots,
            cosigner_xpub,
            emergency_address,
            csv_delay: parsed_or("COVAULT_CSV_DELAY", 6)?,
            derivation_gap: parsed_or("COVAULT_DERIVATION_GAP", 20)?,
            cancel_feerate_factor: parsed_or("COVAULT_CANCEL_FEERATE_FACTOR", 2)?,
            required_confirmations: parsed_or("COVAULT_REQUIRED_CONFIRMATIONS", 1)?,
            poll_interval_secs: parsed_or("COVAULT_POLL_INTERVAL_SECS", 10)?,
            relay_url: env::var("COVAULT_RELAY_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),
            cosigner_url: env::var("COVAULT_COSIGNER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8081".to_string()),
            chain_url: env::var("COVAULT_CHAIN_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:3002".to_string()),
            api_port: parsed_or("COVAULT_API_PORT", 3001)?,
            log_level: env::var("COVAULT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Resolve the stakeholder set from the configured keys. A malformed set
    /// is a startup error, never a runtime one.
    pub fn stakeholder_set(&self) -> Result<StakeholderSet, ConfigError> {
        Ok(StakeholderSet::new(
            self.stakeholder_xpubs.clone(),
            self.xpriv,
            self.manager_slots.clone(),
            self.cosigner_xpub,
        )?)
    }
}

fn required(var: &str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::MissingEnvVar(var.to_string()))
}

fn parsed_or<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(var.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

fn parse_network(s: &str) -> Result<Network, ConfigError> {
    match s.to_lowercase().as_str() {
        "bitcoin" | "mainnet" | "main" => Ok(Network::Bitcoin),
        "testnet" | "test" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        other => Err(ConfigError::InvalidValue(
            "COVAULT_NETWORK".to_string(),
            format!("unknown network: {}", other),
        )),
    }
}

fn parse_xpub_list(raw: &str) -> Result<Vec<Option<Xpub>>, ConfigError> {
    raw.split(',')
        .map(|entry| {
            let entry = entry.trim();
            if entry.eq_ignore_ascii_case("self") {
                Ok(None)
            } else {
                Xpub::from_str(entry).map(Some).map_err(|e| {
                    ConfigError::InvalidValue(
                        "COVAULT_STAKEHOLDER_XPUBS".into(),
                        format!("{}: {}", entry, e),
                    )
                })
            }
        })
        .collect()
}
