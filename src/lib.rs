//! covault - Multi-party Bitcoin Custody Daemon
//!
//! Funds deposited to watched multisig addresses are only spendable through
//! a pre-agreed, pre-signed chain of transactions enforcing a revocable,
//! timelocked unvaulting process. Each stakeholder runs an independent
//! process; the processes derive the same deposit addresses, build the same
//! transaction chains, and exchange signatures through an untrusted relay.
//! A spend additionally needs the signature of an independent cosigner.
//!
//! ## Modules
//!
//! - [`keychain`] / [`script`] / [`txchain`] - deterministic derivation of
//!   keys, scripts and the pre-signed transaction chain
//! - [`scanner`] - deposit detection over the derivation-gap window
//! - [`coordinator`] - signature exchange and verify-on-read
//! - [`vault`] / [`service`] - vault lifecycle and the polling loops
//! - [`spend`] / [`cosigner`] - spend negotiation
//! - [`chain`] / [`relay`] - external collaborator interfaces

pub mod api;
pub mod chain;
pub mod common;
pub mod config;
pub mod coordinator;
pub mod cosigner;
pub mod keychain;
pub mod logging;
pub mod relay;
pub mod scanner;
pub mod script;
pub mod service;
pub mod spend;
pub mod txchain;
pub mod vault;

// Re-exports: error handling
pub use common::error::{CovaultError, Result};

// Re-exports: configuration
pub use config::{Config, ConfigError};

// Re-exports: core engine
pub use coordinator::CoordError;
pub use keychain::{derive_privkey, derive_pubkey, KeyError, StakeholderSet};
pub use scanner::DepositScanner;
pub use service::{SharedVaultService, VaultEntry, VaultService, VaultStats};
pub use spend::{SpendError, SpendProposal};
pub use txchain::{build_chain, build_spend, ChainFeerates, ChainParams, TransactionChain, TxKind};
pub use vault::{Deposit, RetireReason, Vault, VaultStatus};

// Re-exports: external collaborators
pub use chain::{ChainBackend, ChainError, EsploraBackend};
pub use cosigner::{Cosigner, CosignerError, CosignerResponse, HttpCosigner, LocalCosigner};
pub use relay::{FeerateUrgency, HttpRelay, MemoryRelay, RelayError, SignatureRelay};
