//! Vault Script Templates
//!
//! Two fixed templates, both P2WSH:
//!
//! - **Deposit script**: N-of-N CHECKMULTISIG over the stakeholder keys for
//!   one derivation index, in slot order. Deposits, and the output of a
//!   Cancel transaction, pay to this script.
//! - **Unvault script**: two branches. The IF branch is the revocation path,
//!   an immediate N-of-N over the stakeholder keys (used by Cancel and
//!   Unvault-Emergency). The ELSE branch is the spend path, gated by a
//!   relative timelock: manager quorum CHECKMULTISIGVERIFY plus the cosigner
//!   key CHECKSIG.
//!
//! Key order inside the scripts always follows stakeholder slot order, which
//! is what makes independently constructed scripts identical across
//! processes and lets exchanged signatures slot into a canonical witness.

use bitcoin::script::Builder;
use bitcoin::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKMULTISIGVERIFY, OP_CHECKSIG, OP_CSV, OP_DROP, OP_ELSE, OP_ENDIF,
    OP_IF,
};
use bitcoin::{Address, Network, PublicKey, Script, ScriptBuf, Witness};

/// N-of-N multisig locking script for a deposit (and for a Cancel output).
pub fn deposit_script(stakeholders: &[PublicKey]) -> ScriptBuf {
    let n = stakeholders.len() as i64;
    let mut builder = Builder::new().push_int(n);
    for key in stakeholders {
        builder = builder.push_key(key);
    }
    builder.push_int(n).push_opcode(OP_CHECKMULTISIG).into_script()
}

/// Two-branch locking script for the Unvault output.
pub fn unvault_script(
    stakeholders: &[PublicKey],
    managers: &[PublicKey],
    cosigner: &PublicKey,
    csv_delay: u16,
) -> ScriptBuf {
    let n = stakeholders.len() as i64;
    let m = managers.len() as i64;

    let mut builder = Builder::new().push_opcode(OP_IF).push_int(n);
    for key in stakeholders {
        builder = builder.push_key(key);
    }
    builder = builder
        .push_int(n)
        .push_opcode(OP_CHECKMULTISIG)
        .push_opcode(OP_ELSE)
        .push_int(csv_delay as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_int(m);
    for key in managers {
        builder = builder.push_key(key);
    }
    builder
        .push_int(m)
        .push_opcode(OP_CHECKMULTISIGVERIFY)
        .push_key(cosigner)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .into_script()
}

/// P2WSH scriptPubKey for a witness script.
pub fn p2wsh_script_pubkey(witness_script: &Script) -> ScriptBuf {
    ScriptBuf::new_p2wsh(&witness_script.wscript_hash())
}

/// P2WSH address for a witness script.
pub fn p2wsh_address(witness_script: &Script, network: Network) -> Address {
    Address::from_script(&p2wsh_script_pubkey(witness_script), network)
        .expect("a p2wsh script_pubkey is always addressable")
}

/// Witness satisfying a deposit script: CHECKMULTISIG dummy, then one
/// signature per stakeholder in slot order. `sigs` are DER signatures with
/// the sighash byte appended.
pub fn deposit_witness(sigs: &[Vec<u8>], witness_script: &Script) -> Witness {
    let mut items: Vec<Vec<u8>> = Vec::with_capacity(sigs.len() + 2);
    items.push(Vec::new());
    items.extend_from_slice(sigs);
    items.push(witness_script.to_bytes());
    Witness::from_slice(&items)
}

/// Witness satisfying the revocation (IF) branch of an unvault script.
pub fn unvault_revocation_witness(sigs: &[Vec<u8>], witness_script: &Script) -> Witness {
    let mut items: Vec<Vec<u8>> = Vec::with_capacity(sigs.len() + 3);
    items.push(Vec::new());
    items.extend_from_slice(sigs);
    items.push(vec![0x01]);
    items.push(witness_script.to_bytes());
    Witness::from_slice(&items)
}

/// Witness satisfying the spend (ELSE) branch of an unvault script: the
/// cosigner signature at the bottom, the manager signatures in slot order,
/// and an empty branch selector.
pub fn unvault_spend_witness(
    cosigner_sig: &[u8],
    manager_sigs: &[Vec<u8>],
    witness_script: &Script,
) -> Witness {
    let mut items: Vec<Vec<u8>> = Vec::with_capacity(manager_sigs.len() + 4);
    items.push(cosigner_sig.to_vec());
    items.push(Vec::new());
    items.extend_from_slice(manager_sigs);
    items.push(Vec::new());
    items.push(witness_script.to_bytes());
    Witness::from_slice(&items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::StakeholderSet;
    use bitcoin::bip32::{Xpriv, Xpub};
    use secp256k1::SECP256K1;

    fn keys() -> StakeholderSet {
        let masters: Vec<Xpriv> = (1..=4u8)
            .map(|s| Xpriv::new_master(Network::Regtest, &[s; 32]).unwrap())
            .collect();
        let xpubs: Vec<Option<Xpub>> = masters
            .iter()
            .enumerate()
            .map(|(i, m)| (i != 0).then(|| Xpub::from_priv(SECP256K1, m)))
            .collect();
        let cosigner = Xpub::from_priv(
            SECP256K1,
            &Xpriv::new_master(Network::Regtest, &[9; 32]).unwrap(),
        );
        StakeholderSet::new(xpubs, masters[0], vec![0, 1], cosigner).unwrap()
    }

    #[test]
    fn deposit_script_commits_to_key_order() {
        let set = keys();
        let pubkeys = set.pubkeys_at(0).unwrap();
        let script = deposit_script(&pubkeys);

        let mut reversed = pubkeys.clone();
        reversed.reverse();
        assert_ne!(script, deposit_script(&reversed));

        // Same inputs, same bytes.
        assert_eq!(script, deposit_script(&set.pubkeys_at(0).unwrap()));
    }

    #[test]
    fn scripts_differ_per_derivation_index() {
        let set = keys();
        let s0 = deposit_script(&set.pubkeys_at(0).unwrap());
        let s1 = deposit_script(&set.pubkeys_at(1).unwrap());
        assert_ne!(s0, s1);
        assert_ne!(
            p2wsh_address(&s0, Network::Regtest),
            p2wsh_address(&s1, Network::Regtest)
        );
    }

    #[test]
    fn unvault_script_commits_to_csv() {
        let set = keys();
        let stakeholders = set.pubkeys_at(0).unwrap();
        let managers = set.manager_pubkeys_at(0).unwrap();
        let cosigner = set.cosigner_pubkey_at(0).unwrap();

        let a = unvault_script(&stakeholders, &managers, &cosigner, 6);
        let b = unvault_script(&stakeholders, &managers, &cosigner, 7);
        assert_ne!(a, b);
    }

    #[test]
    fn witness_layouts() {
        let set = keys();
        let pubkeys = set.pubkeys_at(0).unwrap();
        let script = deposit_script(&pubkeys);
        let sigs: Vec<Vec<u8>> = (0..4).map(|i| vec![i as u8; 72]).collect();

        let w = deposit_witness(&sigs, &script);
        // dummy + 4 sigs + script
        assert_eq!(w.len(), 6);

        let w = unvault_revocation_witness(&sigs, &script);
        // dummy + 4 sigs + selector + script
        assert_eq!(w.len(), 7);
        assert_eq!(w.nth(5).unwrap(), &[0x01u8][..]);

        let w = unvault_spend_witness(&[7u8; 72], &sigs[..2], &script);
        // cosig + dummy + 2 sigs + selector + script
        assert_eq!(w.len(), 6);
    }
}
