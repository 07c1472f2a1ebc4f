//! Pre-signed Transaction Chain Construction
//!
//! Builds, for one deposit, the fixed chain of transactions every
//! stakeholder must hold signatures for before the deposit is considered
//! usable:
//!
//! 1. **Unvault** - spends the deposit into the two-branch unvault script.
//! 2. **Cancel** - spends the unvault output back to the deposit script, so
//!    a canceled unvault re-enters the pipeline as a fresh vault.
//! 3. **Emergency** - spends the deposit straight to the cold emergency
//!    address, usable at any time.
//! 4. **Unvault-Emergency** - spends the unvault output to the emergency
//!    address, covering the window between Unvault and Spend/Cancel.
//!
//! Construction is a pure function of the deposit, the stakeholder set and
//! the feerates: fixed version, locktime and sequence fields, single input,
//! single output. Independently built chains are byte-identical on every
//! process, which is what makes exchanged signatures interchangeable.

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use thiserror::Error;

use crate::keychain::{KeyError, StakeholderSet};
use crate::relay::{FeerateUrgency, RelayError, SignatureRelay};
use crate::script;
use crate::vault::Deposit;

/// Feerate, in sat/vbyte, the Unvault transaction is built with. The unvault
/// is broadcast under no particular urgency, so it does not go through the
/// shared feerate oracle.
pub const UNVAULT_TX_FEERATE: u64 = 6;

/// Refuse to create a pre-signed output below this value, in sats.
pub const DUST_LIMIT: u64 = 10_000;

/// Transaction chain construction errors
#[derive(Debug, Error)]
pub enum TxChainError {
    #[error("feerate oracle cannot answer for {0}: {1}")]
    FeerateUnavailable(Txid, RelayError),

    #[error("output of {0} tx would be dust ({1} sats)")]
    Dust(&'static str, u64),

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// The kind of a transaction in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TxKind {
    Unvault,
    Cancel,
    Emergency,
    UnvaultEmergency,
    Spend,
}

impl std::fmt::Display for TxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unvault => write!(f, "unvault"),
            Self::Cancel => write!(f, "cancel"),
            Self::Emergency => write!(f, "emergency"),
            Self::UnvaultEmergency => write!(f, "unvault_emergency"),
            Self::Spend => write!(f, "spend"),
        }
    }
}

/// Feerates, in sat/vbyte, used for the revocation transactions. Both come
/// from the shared oracle so every stakeholder builds the same chain.
#[derive(Debug, Clone, Copy)]
pub struct ChainFeerates {
    pub emergency: u64,
    pub cancel: u64,
}

impl ChainFeerates {
    /// Fetch the feerates for a deposit's chain from the oracle. The oracle
    /// answers per `(urgency, txid)` and caches, so all stakeholders get the
    /// same numbers. The cancel rate is additionally scaled so a Cancel
    /// outbids the spend path it races.
    pub async fn fetch(
        relay: &dyn SignatureRelay,
        deposit_txid: &Txid,
        cancel_feerate_factor: u64,
    ) -> Result<Self, TxChainError> {
        let emergency = relay
            .get_feerate(FeerateUrgency::Emergency, deposit_txid)
            .await
            .map_err(|e| TxChainError::FeerateUnavailable(*deposit_txid, e))?;
        let cancel = relay
            .get_feerate(FeerateUrgency::Cancel, deposit_txid)
            .await
            .map_err(|e| TxChainError::FeerateUnavailable(*deposit_txid, e))?;
        Ok(Self {
            emergency,
            cancel: cancel * cancel_feerate_factor,
        })
    }
}

/// Parameters that are fixed configuration, identical on every process.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: Network,
    pub csv_delay: u16,
    pub emergency_address: Address,
    pub cancel_feerate_factor: u64,
}

/// One unsigned transaction of the chain together with everything needed to
/// compute its sighash: the witness script and value of the single P2WSH
/// output it spends.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTx {
    pub kind: TxKind,
    pub tx: Transaction,
    pub witness_script: ScriptBuf,
    pub prev_value: Amount,
}

impl ChainTx {
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }
}

/// The full pre-signed chain for one deposit.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionChain {
    pub unvault: ChainTx,
    pub cancel: ChainTx,
    pub emergency: ChainTx,
    pub unvault_emergency: ChainTx,
    pub deposit_script: ScriptBuf,
    pub unvault_script: ScriptBuf,
}

impl TransactionChain {
    pub fn get(&self, kind: TxKind) -> Option<&ChainTx> {
        match kind {
            TxKind::Unvault => Some(&self.unvault),
            TxKind::Cancel => Some(&self.cancel),
            TxKind::Emergency => Some(&self.emergency),
            TxKind::UnvaultEmergency => Some(&self.unvault_emergency),
            TxKind::Spend => None,
        }
    }

    /// The outpoint of the unvault output, spent by Cancel, Unvault-Emergency
    /// and Spend.
    pub fn unvault_outpoint(&self) -> OutPoint {
        OutPoint::new(self.unvault.txid(), 0)
    }
}

// All pre-signed transactions are 1-in/1-out P2WSH spends. The witness size
// is dominated by the stakeholder signatures and the witness script, both
// linear in N, so the estimate only depends on the stakeholder count.
fn presigned_tx_vbytes(n_stakeholders: usize) -> u64 {
    let n = n_stakeholders as u64;
    let witness_bytes = 2 + 74 * n + (36 * n + 12);
    // non-witness: version + in/out counts + outpoint + sequence + txout + locktime
    95 + witness_bytes / 4 + 1
}

fn fee_for(n_stakeholders: usize, feerate: u64) -> Amount {
    Amount::from_sat(presigned_tx_vbytes(n_stakeholders) * feerate)
}

fn output_value(
    kind: &'static str,
    input_value: Amount,
    fee: Amount,
) -> Result<Amount, TxChainError> {
    let value = input_value
        .checked_sub(fee)
        .unwrap_or(Amount::ZERO);
    if value.to_sat() < DUST_LIMIT {
        return Err(TxChainError::Dust(kind, value.to_sat()));
    }
    Ok(value)
}

fn chain_txin(prev: OutPoint, sequence: Sequence) -> TxIn {
    TxIn {
        previous_output: prev,
        script_sig: ScriptBuf::new(),
        sequence,
        witness: Witness::new(),
    }
}

fn chain_tx(input: TxIn, output: TxOut) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![input],
        output: vec![output],
    }
}

/// Build the four pre-signed transactions for a deposit.
pub fn build_chain(
    deposit: &Deposit,
    keys: &StakeholderSet,
    params: &ChainParams,
    feerates: ChainFeerates,
) -> Result<TransactionChain, TxChainError> {
    let index = deposit.derivation_index;
    let stakeholders = keys.pubkeys_at(index)?;
    let managers = keys.manager_pubkeys_at(index)?;
    let cosigner = keys.cosigner_pubkey_at(index)?;

    let deposit_script = script::deposit_script(&stakeholders);
    let unvault_script =
        script::unvault_script(&stakeholders, &managers, &cosigner, params.csv_delay);

    let n = stakeholders.len();
    let emergency_spk = params.emergency_address.script_pubkey();

    // Unvault: deposit -> unvault script.
    let unvault_value = output_value(
        "unvault",
        deposit.amount,
        fee_for(n, UNVAULT_TX_FEERATE),
    )?;
    let unvault_tx = chain_tx(
        chain_txin(deposit.outpoint, Sequence::ENABLE_RBF_NO_LOCKTIME),
        TxOut {
            value: unvault_value,
            script_pubkey: script::p2wsh_script_pubkey(&unvault_script),
        },
    );
    let unvault_outpoint = OutPoint::new(unvault_tx.compute_txid(), 0);

    // Cancel: unvault -> deposit script, outbidding the spend path.
    let cancel_value = output_value("cancel", unvault_value, fee_for(n, feerates.cancel))?;
    let cancel_tx = chain_tx(
        chain_txin(unvault_outpoint, Sequence::ENABLE_RBF_NO_LOCKTIME),
        TxOut {
            value: cancel_value,
            script_pubkey: script::p2wsh_script_pubkey(&deposit_script),
        },
    );

    // Emergency: deposit -> cold address.
    let emergency_value = output_value(
        "emergency",
        deposit.amount,
        fee_for(n, feerates.emergency),
    )?;
    let emergency_tx = chain_tx(
        chain_txin(deposit.outpoint, Sequence::ENABLE_RBF_NO_LOCKTIME),
        TxOut {
            value: emergency_value,
            script_pubkey: emergency_spk.clone(),
        },
    );

    // Unvault-Emergency: unvault -> cold address.
    let unvault_emergency_value = output_value(
        "unvault_emergency",
        unvault_value,
        fee_for(n, feerates.emergency),
    )?;
    let unvault_emergency_tx = chain_tx(
        chain_txin(unvault_outpoint, Sequence::ENABLE_RBF_NO_LOCKTIME),
        TxOut {
            value: unvault_emergency_value,
            script_pubkey: emergency_spk,
        },
    );

    Ok(TransactionChain {
        unvault: ChainTx {
            kind: TxKind::Unvault,
            tx: unvault_tx,
            witness_script: deposit_script.clone(),
            prev_value: deposit.amount,
        },
        cancel: ChainTx {
            kind: TxKind::Cancel,
            tx: cancel_tx,
            witness_script: unvault_script.clone(),
            prev_value: unvault_value,
        },
        emergency: ChainTx {
            kind: TxKind::Emergency,
            tx: emergency_tx,
            witness_script: deposit_script.clone(),
            prev_value: deposit.amount,
        },
        unvault_emergency: ChainTx {
            kind: TxKind::UnvaultEmergency,
            tx: unvault_emergency_tx,
            witness_script: unvault_script.clone(),
            prev_value: unvault_value,
        },
        deposit_script,
        unvault_script,
    })
}

/// Build a Spend transaction from an unvault output. The fee is implicit
/// (`unvault value - amount`), so every approver reconstructing from
/// `(outpoint, amount, destination)` obtains the exact same transaction.
pub fn build_spend(
    unvault_outpoint: OutPoint,
    unvault_value: Amount,
    unvault_script: &ScriptBuf,
    destination: &Address,
    amount: Amount,
    csv_delay: u16,
) -> Result<ChainTx, TxChainError> {
    if amount.to_sat() < DUST_LIMIT || amount > unvault_value {
        return Err(TxChainError::Dust("spend", amount.to_sat()));
    }

    let tx = chain_tx(
        chain_txin(unvault_outpoint, Sequence::from_height(csv_delay)),
        TxOut {
            value: amount,
            script_pubkey: destination.script_pubkey(),
        },
    );

    Ok(ChainTx {
        kind: TxKind::Spend,
        tx,
        witness_script: unvault_script.clone(),
        prev_value: unvault_value,
    })
}
