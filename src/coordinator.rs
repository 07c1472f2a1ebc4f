//! Distributed Signature Coordination
//!
//! Drives signature collection for one pre-signed transaction: compute the
//! sighash, sign with our slot's key, submit to the relay, then poll the
//! other slots and verify everything fetched against the expected public key
//! and the exact local sighash. The relay has no authority over validity;
//! a signature that fails verification is discarded, surfaced as an
//! `invalid_signature` anomaly, and simply re-fetched on a later poll.
//!
//! All steps are idempotent: signing twice overwrites the same relay slot,
//! polling a complete transaction is a no-op, slots only ever fill.

use bitcoin::hashes::Hash;
use bitcoin::sighash::SighashCache;
use bitcoin::EcdsaSighashType;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, SECP256K1};
use thiserror::Error;

use crate::keychain::{KeyError, StakeholderSet};
use crate::relay::{RelayError, SignatureRelay};
use crate::script;
use crate::txchain::{ChainTx, TxKind};
use crate::vault::PresignedTx;

/// Coordination errors
#[derive(Debug, Error)]
pub enum CoordError {
    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("cannot compute sighash: {0}")]
    Sighash(String),
}

/// Sighash message for a chain transaction. Every transaction in the chain
/// spends a single P2WSH output with `SIGHASH_ALL`.
pub fn sighash_message(chain_tx: &ChainTx) -> Result<Message, CoordError> {
    let mut cache = SighashCache::new(&chain_tx.tx);
    let sighash = cache
        .p2wsh_signature_hash(
            0,
            &chain_tx.witness_script,
            chain_tx.prev_value,
            EcdsaSighashType::All,
        )
        .map_err(|e| CoordError::Sighash(e.to_string()))?;
    Message::from_digest_slice(sighash.as_byte_array())
        .map_err(|e| CoordError::Sighash(e.to_string()))
}

/// DER signature with the `SIGHASH_ALL` byte appended, as it goes in a
/// witness.
fn witness_sig(der: &[u8]) -> Vec<u8> {
    let mut sig = der.to_vec();
    sig.push(EcdsaSighashType::All as u8);
    sig
}

/// Sign a pre-signed transaction with our slot key and submit the signature
/// to the relay. Idempotent; re-submission overwrites the same slot.
pub async fn sign_and_submit(
    ptx: &mut PresignedTx,
    keys: &StakeholderSet,
    derivation_index: u32,
    relay: &dyn SignatureRelay,
) -> Result<(), CoordError> {
    let msg = sighash_message(&ptx.chain_tx)?;
    let privkey = keys.our_privkey_at(derivation_index)?;
    let sig = SECP256K1.sign_ecdsa(&msg, &privkey);
    let der = sig.serialize_der().to_vec();

    relay.put_signature(&ptx.txid(), keys.our_slot(), &der).await?;
    ptx.sigs.insert(keys.our_slot(), der);
    ptx.submitted = true;

    tracing::debug!(
        target: "covault::coordinator",
        txid = %ptx.txid(),
        kind = %ptx.kind,
        slot = keys.our_slot(),
        "submitted our signature"
    );
    Ok(())
}

/// Poll the relay for the signatures we are missing, verify each against its
/// slot's public key and this transaction's sighash, and assemble the final
/// witness once every slot is filled. Returns whether the transaction is now
/// fully signed.
pub async fn poll_peers(
    ptx: &mut PresignedTx,
    keys: &StakeholderSet,
    derivation_index: u32,
    relay: &dyn SignatureRelay,
) -> Result<bool, CoordError> {
    if ptx.is_complete() {
        return Ok(true);
    }

    let msg = sighash_message(&ptx.chain_tx)?;
    let txid = ptx.txid();

    for slot in 0..keys.len() {
        if ptx.sigs.contains_key(&slot) {
            continue;
        }
        let Some(der) = relay.get_signature(&txid, slot).await? else {
            continue;
        };

        let sig = match Signature::from_der(&der) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::warn!(
                    target: "covault::coordinator",
                    txid = %txid,
                    slot,
                    anomaly = "invalid_signature",
                    "undecodable signature from relay: {}",
                    e
                );
                continue;
            }
        };

        let pubkey = keys.pubkey_at(slot, derivation_index)?;
        if let Err(e) = SECP256K1.verify_ecdsa(&msg, &sig, &pubkey.inner) {
            tracing::warn!(
                target: "covault::coordinator",
                txid = %txid,
                slot,
                anomaly = "invalid_signature",
                "signature does not verify for slot pubkey: {}",
                e
            );
            continue;
        }

        ptx.sigs.insert(slot, der);
    }

    if ptx.sigs.len() == keys.len() {
        finalize(ptx);
        tracing::info!(
            target: "covault::coordinator",
            txid = %txid,
            kind = %ptx.kind,
            "all {} signatures collected, transaction fully signed",
            keys.len()
        );
        return Ok(true);
    }
    Ok(false)
}

/// Assemble the witness from the filled slots, in canonical slot order.
fn finalize(ptx: &mut PresignedTx) {
    let sigs: Vec<Vec<u8>> = ptx.sigs.values().map(|der| witness_sig(der)).collect();
    let witness = match ptx.kind {
        // Unvault and Emergency satisfy the deposit script directly.
        TxKind::Unvault | TxKind::Emergency => {
            script::deposit_witness(&sigs, &ptx.chain_tx.witness_script)
        }
        // Cancel and Unvault-Emergency take the revocation branch of the
        // unvault script.
        TxKind::Cancel | TxKind::UnvaultEmergency => {
            script::unvault_revocation_witness(&sigs, &ptx.chain_tx.witness_script)
        }
        TxKind::Spend => unreachable!("spend witnesses are assembled by spend negotiation"),
    };
    ptx.finalize(witness);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MemoryRelay;
    use crate::txchain::{build_chain, ChainFeerates, ChainParams};
    use crate::vault::Deposit;
    use bitcoin::bip32::{Xpriv, Xpub};
    use bitcoin::{Amount, Network, OutPoint, Txid};
    use std::str::FromStr;

    fn keys(our: usize) -> StakeholderSet {
        let masters: Vec<Xpriv> = (1..=4u8)
            .map(|s| Xpriv::new_master(Network::Regtest, &[s; 32]).unwrap())
            .collect();
        let xpubs: Vec<Option<Xpub>> = masters
            .iter()
            .enumerate()
            .map(|(i, m)| (i != our).then(|| Xpub::from_priv(SECP256K1, m)))
            .collect();
        let cosigner = Xpub::from_priv(
            SECP256K1,
            &Xpriv::new_master(Network::Regtest, &[9; 32]).unwrap(),
        );
        StakeholderSet::new(xpubs, masters[our], vec![0, 1], cosigner).unwrap()
    }

    fn emergency_ptx(keys: &StakeholderSet) -> PresignedTx {
        let emergency = script::p2wsh_address(
            &script::deposit_script(&keys.pubkeys_at(1000).unwrap()),
            Network::Regtest,
        );
        let params = ChainParams {
            network: Network::Regtest,
            csv_delay: 6,
            emergency_address: emergency,
            cancel_feerate_factor: 2,
        };
        let deposit = Deposit {
            outpoint: OutPoint::new(
                Txid::from_str(
                    "39a8212c6a9b467680d43e47b61b8363fe1febb761f9f548eb4a432b2bc9bbec",
                )
                .unwrap(),
                0,
            ),
            amount: Amount::from_sat(10_000_000),
            derivation_index: 0,
        };
        let chain = build_chain(
            &deposit,
            keys,
            &params,
            ChainFeerates {
                emergency: 22,
                cancel: 44,
            },
        )
        .unwrap();
        PresignedTx::new(chain.emergency)
    }

    #[tokio::test]
    async fn four_stakeholders_complete_a_transaction() {
        let relay = MemoryRelay::new();
        let sets: Vec<StakeholderSet> = (0..4).map(keys).collect();
        let mut ptxs: Vec<PresignedTx> = sets.iter().map(emergency_ptx).collect();

        for (set, ptx) in sets.iter().zip(ptxs.iter_mut()) {
            sign_and_submit(ptx, set, 0, &relay).await.unwrap();
            // Not complete yet on the first passes.
        }
        for (set, ptx) in sets.iter().zip(ptxs.iter_mut()) {
            let complete = poll_peers(ptx, set, 0, &relay).await.unwrap();
            assert!(complete);
            assert!(ptx.is_complete());
            // dummy + 4 sigs + witness script
            assert_eq!(ptx.finalized.as_ref().unwrap().input[0].witness.len(), 6);
        }

        // Re-polling a complete transaction is a no-op.
        let complete = poll_peers(&mut ptxs[0], &sets[0], 0, &relay).await.unwrap();
        assert!(complete);
    }

    #[tokio::test]
    async fn garbage_signature_is_discarded_and_refetched() {
        let relay = MemoryRelay::new();
        let us = keys(0);
        let peer = keys(1);
        let mut ptx = emergency_ptx(&us);
        let mut peer_ptx = emergency_ptx(&peer);
        let txid = ptx.txid();

        sign_and_submit(&mut ptx, &us, 0, &relay).await.unwrap();

        // A corrupt blob in slot 1 is discarded, not trusted.
        relay.put_signature(&txid, 1, &[0xde, 0xad]).await.unwrap();
        assert!(!poll_peers(&mut ptx, &us, 0, &relay).await.unwrap());
        assert!(!ptx.sigs.contains_key(&1));

        // A valid signature from the wrong key is also discarded.
        let msg = sighash_message(&ptx.chain_tx).unwrap();
        let wrong = SECP256K1.sign_ecdsa(&msg, &peer.our_privkey_at(7).unwrap());
        relay
            .put_signature(&txid, 1, &wrong.serialize_der())
            .await
            .unwrap();
        assert!(!poll_peers(&mut ptx, &us, 0, &relay).await.unwrap());
        assert!(!ptx.sigs.contains_key(&1));

        // The relay slot recovering on a later poll fills the slot.
        sign_and_submit(&mut peer_ptx, &peer, 0, &relay).await.unwrap();
        poll_peers(&mut ptx, &us, 0, &relay).await.unwrap();
        assert!(ptx.sigs.contains_key(&1));
    }

    #[tokio::test]
    async fn missing_peers_leave_the_transaction_pending() {
        let relay = MemoryRelay::new();
        let us = keys(2);
        let mut ptx = emergency_ptx(&us);

        sign_and_submit(&mut ptx, &us, 0, &relay).await.unwrap();
        let complete = poll_peers(&mut ptx, &us, 0, &relay).await.unwrap();
        assert!(!complete);
        assert_eq!(ptx.sigs.len(), 1);
        assert!(!ptx.is_complete());
    }
}
