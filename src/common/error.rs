//! Common Error Types
//!
//! Root error wrapper across all modules. Transient transport errors are
//! retryable and never terminate the process; configuration errors are
//! fatal at startup.

use thiserror::Error;

/// Root error type for the daemon
#[derive(Debug, Error)]
pub enum CovaultError {
    /// Configuration errors, fatal at startup
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] crate::logging::LoggingError),

    /// Key derivation errors
    #[error("key error: {0}")]
    Key(#[from] crate::keychain::KeyError),

    /// Transaction chain construction errors
    #[error("transaction chain error: {0}")]
    TxChain(#[from] crate::txchain::TxChainError),

    /// Chain backend errors, transient
    #[error("chain backend error: {0}")]
    Chain(#[from] crate::chain::ChainError),

    /// Signature relay errors, transient
    #[error("relay error: {0}")]
    Relay(#[from] crate::relay::RelayError),

    /// Cosigner errors
    #[error("cosigner error: {0}")]
    Cosigner(#[from] crate::cosigner::CosignerError),

    /// Signature coordination errors
    #[error("coordination error: {0}")]
    Coordination(#[from] crate::coordinator::CoordError),

    /// Deposit scanning errors
    #[error("scanner error: {0}")]
    Scan(#[from] crate::scanner::ScanError),

    /// Spend negotiation errors
    #[error("spend error: {0}")]
    Spend(#[from] crate::spend::SpendError),

    /// Unknown vault outpoint
    #[error("no vault at {0}")]
    UnknownVault(bitcoin::OutPoint),

    /// An operation needing a fully signed transaction hit one that is not
    #[error("{0} transaction of vault {1} is not fully signed")]
    NotFullySigned(crate::txchain::TxKind, bitcoin::OutPoint),
}

impl CovaultError {
    /// Whether the operation can be retried on a later poll.
    pub fn is_retryable(&self) -> bool {
        match self {
            CovaultError::Chain(_) | CovaultError::Relay(_) => true,
            CovaultError::TxChain(e) => {
                matches!(e, crate::txchain::TxChainError::FeerateUnavailable(_, _))
            }
            _ => false,
        }
    }
}

/// Result type alias using CovaultError
pub type Result<T> = std::result::Result<T, CovaultError>;
