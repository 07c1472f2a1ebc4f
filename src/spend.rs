//! Spend Negotiation
//!
//! A manager proposes a Spend of an unvaulted vault by broadcasting only the
//! parameters (deposit outpoint, amount, destination) plus the txid of the
//! transaction it built from them. Nobody ever trusts a peer-supplied
//! serialized transaction: every approver (peer managers and the cosigner)
//! rebuilds the Spend from the parameters and signs its own reconstruction,
//! refusing with `SpendMismatch` when the txids diverge.

use bitcoin::{Address, Amount, OutPoint, Transaction, Txid};
use secp256k1::ecdsa::Signature;
use secp256k1::SECP256K1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::coordinator::{self, CoordError};
use crate::keychain::{KeyError, StakeholderSet};
use crate::script;
use crate::txchain::{self, ChainTx, TxChainError};
use crate::vault::Vault;

/// Spend negotiation errors
#[derive(Debug, Error)]
pub enum SpendError {
    #[error("reconstructed spend {reconstructed} does not match proposal {proposed}")]
    SpendMismatch {
        proposed: Txid,
        reconstructed: Txid,
    },

    #[error("vault is not unvault-signed yet")]
    NotUnvaultSigned,

    #[error("we are not a manager")]
    NotManager,

    #[error("cosigner refused to sign: {0}")]
    CosignerRejected(String),

    #[error("missing signature for manager slot {0}")]
    MissingSignature(usize),

    #[error("signature for manager slot {0} does not verify")]
    InvalidSignature(usize),

    #[error("invalid destination address: {0}")]
    InvalidDestination(String),

    #[error(transparent)]
    Tx(#[from] TxChainError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Coord(#[from] CoordError),
}

/// The parameters a spend is negotiated from. This is the only thing that
/// travels between parties, along with the resulting signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendProposal {
    /// The vault being spent, identified by its deposit outpoint.
    pub deposit_outpoint: OutPoint,
    /// Txid of the Spend the initiator built; approvers must reproduce it.
    pub spend_txid: Txid,
    /// Amount paid to the destination, in sats.
    pub amount: u64,
    /// Destination address.
    pub destination: String,
}

/// Local state of an in-progress spend negotiation.
#[derive(Debug, Clone)]
pub struct SpendState {
    pub proposal: SpendProposal,
    pub chain_tx: ChainTx,
    /// Verified manager DER signatures, by stakeholder slot.
    pub manager_sigs: BTreeMap<usize, Vec<u8>>,
    /// The cosigner's DER signature, once obtained.
    pub cosigner_sig: Option<Vec<u8>>,
    /// The fully signed transaction, once assembled.
    pub finalized: Option<Transaction>,
}

fn parse_destination(
    destination: &str,
    network: bitcoin::Network,
) -> Result<Address, SpendError> {
    use std::str::FromStr;
    Address::from_str(destination)
        .map_err(|e| SpendError::InvalidDestination(e.to_string()))?
        .require_network(network)
        .map_err(|e| SpendError::InvalidDestination(e.to_string()))
}

/// Rebuild a vault's Spend transaction from negotiation parameters.
pub fn reconstruct_spend(
    vault: &Vault,
    amount: Amount,
    destination: &str,
    network: bitcoin::Network,
    csv_delay: u16,
) -> Result<ChainTx, SpendError> {
    let destination = parse_destination(destination, network)?;
    Ok(txchain::build_spend(
        vault.unvault_outpoint(),
        vault.unvault.chain_tx.tx.output[0].value,
        &vault.unvault_script,
        &destination,
        amount,
        csv_delay,
    )?)
}

/// Initiator side: build the Spend for a vault we manage, sign it with our
/// manager key, and return the negotiation state plus the proposal to send
/// to approvers.
pub fn initiate(
    vault: &Vault,
    keys: &StakeholderSet,
    amount: Amount,
    destination: &str,
    network: bitcoin::Network,
    csv_delay: u16,
) -> Result<SpendState, SpendError> {
    if !keys.we_are_manager() {
        return Err(SpendError::NotManager);
    }
    if !vault.unvault_signed() {
        return Err(SpendError::NotUnvaultSigned);
    }

    let chain_tx = reconstruct_spend(vault, amount, destination, network, csv_delay)?;
    let proposal = SpendProposal {
        deposit_outpoint: vault.outpoint(),
        spend_txid: chain_tx.txid(),
        amount: amount.to_sat(),
        destination: destination.to_string(),
    };

    let mut state = SpendState {
        proposal,
        chain_tx,
        manager_sigs: BTreeMap::new(),
        cosigner_sig: None,
        finalized: None,
    };
    let our_sig = approve_inner(&state.chain_tx, keys, vault.deposit.derivation_index)?;
    state.manager_sigs.insert(keys.our_slot(), our_sig);
    Ok(state)
}

/// Approver side: independently rebuild the Spend from the proposal and sign
/// it only if our reconstruction matches the proposed txid.
pub fn approve(
    vault: &Vault,
    proposal: &SpendProposal,
    keys: &StakeholderSet,
    network: bitcoin::Network,
    csv_delay: u16,
) -> Result<Vec<u8>, SpendError> {
    if !keys.we_are_manager() {
        return Err(SpendError::NotManager);
    }
    if !vault.unvault_signed() {
        return Err(SpendError::NotUnvaultSigned);
    }

    let reconstructed = reconstruct_spend(
        vault,
        Amount::from_sat(proposal.amount),
        &proposal.destination,
        network,
        csv_delay,
    )?;
    if reconstructed.txid() != proposal.spend_txid {
        return Err(SpendError::SpendMismatch {
            proposed: proposal.spend_txid,
            reconstructed: reconstructed.txid(),
        });
    }

    approve_inner(&reconstructed, keys, vault.deposit.derivation_index)
}

fn approve_inner(
    chain_tx: &ChainTx,
    keys: &StakeholderSet,
    derivation_index: u32,
) -> Result<Vec<u8>, SpendError> {
    let msg = coordinator::sighash_message(chain_tx)?;
    let privkey = keys.our_privkey_at(derivation_index)?;
    Ok(SECP256K1.sign_ecdsa(&msg, &privkey).serialize_der().to_vec())
}

/// Initiator side: verify the collected manager and cosigner signatures and
/// assemble the final witness. Requires one signature per manager slot plus
/// the cosigner's.
pub fn complete(
    state: &mut SpendState,
    keys: &StakeholderSet,
    derivation_index: u32,
) -> Result<Transaction, SpendError> {
    let msg = coordinator::sighash_message(&state.chain_tx)?;

    let mut manager_sigs = Vec::with_capacity(keys.manager_slots().len());
    for slot in keys.manager_slots() {
        let der = state
            .manager_sigs
            .get(slot)
            .ok_or(SpendError::MissingSignature(*slot))?;
        let sig = Signature::from_der(der).map_err(|_| SpendError::InvalidSignature(*slot))?;
        let pubkey = keys.pubkey_at(*slot, derivation_index)?;
        SECP256K1
            .verify_ecdsa(&msg, &sig, &pubkey.inner)
            .map_err(|_| SpendError::InvalidSignature(*slot))?;
        let mut wsig = der.clone();
        wsig.push(bitcoin::EcdsaSighashType::All as u8);
        manager_sigs.push(wsig);
    }

    let cosigner_der = state
        .cosigner_sig
        .as_ref()
        .ok_or_else(|| SpendError::CosignerRejected("no signature obtained".into()))?;
    let cosig = Signature::from_der(cosigner_der)
        .map_err(|_| SpendError::CosignerRejected("undecodable signature".into()))?;
    let cosigner_pubkey = keys.cosigner_pubkey_at(derivation_index)?;
    SECP256K1
        .verify_ecdsa(&msg, &cosig, &cosigner_pubkey.inner)
        .map_err(|_| SpendError::CosignerRejected("signature does not verify".into()))?;
    let mut cosigner_wsig = cosigner_der.clone();
    cosigner_wsig.push(bitcoin::EcdsaSighashType::All as u8);

    let witness = script::unvault_spend_witness(
        &cosigner_wsig,
        &manager_sigs,
        &state.chain_tx.witness_script,
    );
    let mut tx = state.chain_tx.tx.clone();
    tx.input[0].witness = witness;
    state.finalized = Some(tx.clone());

    tracing::info!(
        target: "covault::spend",
        txid = %state.proposal.spend_txid,
        "spend transaction fully signed"
    );
    Ok(tx)
}
