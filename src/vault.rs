//! Vault Records
//!
//! One `Vault` per observed deposit output, tracking the pre-signed
//! transaction chain and the progress of signature collection for each of
//! its four transactions. The lifecycle:
//!
//! detected → emergency_signed / unvault_signed → secure
//!          → { spending | cancelling | emergency_broadcast } → retired
//!
//! The `unvault_secure` flag is always derived, never stored: a vault is
//! secure iff Emergency, Unvault, Cancel and Unvault-Emergency are all fully
//! signed. Retirement is driven by confirmed on-chain events only, and can
//! hit a vault in any state, signed or not.

use bitcoin::{Amount, OutPoint, Transaction, Txid, Witness};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::spend::SpendState;
use crate::txchain::{ChainTx, TransactionChain, TxKind};

/// A confirmed funding output, immutable once observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deposit {
    pub outpoint: OutPoint,
    pub amount: Amount,
    pub derivation_index: u32,
}

/// Lifecycle state of a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultStatus {
    /// Deposit observed, chain built, signature exchange in progress.
    Detected,
    /// The Emergency transaction is fully signed.
    EmergencySigned,
    /// The Unvault transaction is fully signed.
    UnvaultSigned,
    /// Every revocation path is fully signed; safe to eventually unvault.
    Secure,
    /// The Unvault transaction is on-chain; spend window open.
    Spending,
    /// A Cancel spend of the unvault output has been seen.
    Cancelling,
    /// An Emergency or Unvault-Emergency spend has been seen.
    EmergencyBroadcast,
    /// Terminal. The vault's coin moved in a confirmed transaction.
    Retired,
}

impl std::fmt::Display for VaultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Detected => "detected",
            Self::EmergencySigned => "emergency_signed",
            Self::UnvaultSigned => "unvault_signed",
            Self::Secure => "secure",
            Self::Spending => "spending",
            Self::Cancelling => "cancelling",
            Self::EmergencyBroadcast => "emergency_broadcast",
            Self::Retired => "retired",
        };
        write!(f, "{}", s)
    }
}

/// Why a vault left the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireReason {
    /// Final Spend confirmed.
    Spent,
    /// Cancel confirmed; a replacement vault was created from its output.
    Cancelled,
    /// Emergency confirmed.
    Emergencied,
    /// Unvault-Emergency confirmed.
    UnvaultEmergencied,
    /// The deposit was spent by a transaction we did not pre-sign.
    External,
}

/// A pre-signed transaction plus its signature slots.
///
/// Slots fill monotonically, one verified signature per stakeholder, until
/// every slot holds one; then the canonical witness can be assembled.
#[derive(Debug, Clone)]
pub struct PresignedTx {
    pub kind: TxKind,
    pub chain_tx: ChainTx,
    /// Verified DER signatures (sighash byte not included), by stakeholder
    /// slot. Never cleared.
    pub sigs: BTreeMap<usize, Vec<u8>>,
    /// Whether our own signature has been submitted to the relay.
    pub submitted: bool,
    /// The fully signed transaction, set once all slots are filled.
    pub finalized: Option<Transaction>,
}

impl PresignedTx {
    pub fn new(chain_tx: ChainTx) -> Self {
        Self {
            kind: chain_tx.kind,
            chain_tx,
            sigs: BTreeMap::new(),
            submitted: false,
            finalized: None,
        }
    }

    pub fn txid(&self) -> Txid {
        self.chain_tx.txid()
    }

    pub fn is_complete(&self) -> bool {
        self.finalized.is_some()
    }

    /// Apply an assembled witness, marking the transaction fully signed.
    pub fn finalize(&mut self, witness: Witness) {
        let mut tx = self.chain_tx.tx.clone();
        tx.input[0].witness = witness;
        self.finalized = Some(tx);
    }
}

/// One tracked custody entry.
#[derive(Debug, Clone)]
pub struct Vault {
    pub deposit: Deposit,
    pub status: VaultStatus,
    pub deposit_script: bitcoin::ScriptBuf,
    pub unvault_script: bitcoin::ScriptBuf,
    pub emergency: PresignedTx,
    pub unvault: PresignedTx,
    pub cancel: PresignedTx,
    pub unvault_emergency: PresignedTx,
    pub spend: Option<SpendState>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Vault {
    pub fn new(deposit: Deposit, chain: TransactionChain) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            deposit,
            status: VaultStatus::Detected,
            deposit_script: chain.deposit_script,
            unvault_script: chain.unvault_script,
            emergency: PresignedTx::new(chain.emergency),
            unvault: PresignedTx::new(chain.unvault),
            cancel: PresignedTx::new(chain.cancel),
            unvault_emergency: PresignedTx::new(chain.unvault_emergency),
            spend: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        self.deposit.outpoint
    }

    /// The outpoint of this vault's unvault output.
    pub fn unvault_outpoint(&self) -> OutPoint {
        OutPoint::new(self.unvault.txid(), 0)
    }

    pub fn presigned(&self, kind: TxKind) -> Option<&PresignedTx> {
        match kind {
            TxKind::Emergency => Some(&self.emergency),
            TxKind::Unvault => Some(&self.unvault),
            TxKind::Cancel => Some(&self.cancel),
            TxKind::UnvaultEmergency => Some(&self.unvault_emergency),
            TxKind::Spend => None,
        }
    }

    pub fn presigned_mut(&mut self, kind: TxKind) -> Option<&mut PresignedTx> {
        match kind {
            TxKind::Emergency => Some(&mut self.emergency),
            TxKind::Unvault => Some(&mut self.unvault),
            TxKind::Cancel => Some(&mut self.cancel),
            TxKind::UnvaultEmergency => Some(&mut self.unvault_emergency),
            TxKind::Spend => None,
        }
    }

    pub fn emergency_signed(&self) -> bool {
        self.emergency.is_complete()
    }

    pub fn unvault_signed(&self) -> bool {
        self.unvault.is_complete()
    }

    /// Derived, never stored: secure iff every revocation path is signed.
    pub fn unvault_secure(&self) -> bool {
        self.emergency_signed()
            && self.unvault_signed()
            && self.cancel.is_complete()
            && self.unvault_emergency.is_complete()
    }

    /// Whether signature exchange should still run for this vault.
    pub fn is_signing(&self) -> bool {
        matches!(
            self.status,
            VaultStatus::Detected
                | VaultStatus::EmergencySigned
                | VaultStatus::UnvaultSigned
                | VaultStatus::Secure
        )
    }

    pub fn is_active(&self) -> bool {
        self.status != VaultStatus::Retired
    }

    /// Recompute the signing-progress state from the completion flags.
    /// On-chain states (spending/cancelling/...) are never downgraded.
    pub fn refresh_status(&mut self) {
        if !self.is_signing() {
            return;
        }
        let next = if self.unvault_secure() {
            VaultStatus::Secure
        } else if self.unvault_signed() {
            VaultStatus::UnvaultSigned
        } else if self.emergency_signed() {
            VaultStatus::EmergencySigned
        } else {
            VaultStatus::Detected
        };
        if next != self.status {
            tracing::info!(
                target: "covault::vault",
                outpoint = %self.outpoint(),
                "vault status {} -> {}",
                self.status,
                next
            );
            self.status = next;
            self.touch();
        }
    }

    /// The unvault transaction was seen spending the deposit.
    pub fn mark_spending(&mut self) {
        self.status = VaultStatus::Spending;
        self.touch();
    }

    /// A cancel spend of the unvault output was seen.
    pub fn mark_cancelling(&mut self) {
        self.status = VaultStatus::Cancelling;
        self.touch();
    }

    /// An emergency spend was seen.
    pub fn mark_emergency_broadcast(&mut self) {
        self.status = VaultStatus::EmergencyBroadcast;
        self.touch();
    }

    pub fn mark_retired(&mut self) {
        self.status = VaultStatus::Retired;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp();
    }
}

/// A retired vault, kept for the operator surface.
#[derive(Debug, Clone, Serialize)]
pub struct RetiredVault {
    pub deposit_outpoint: String,
    pub reason: RetireReason,
    pub spending_txid: String,
}
