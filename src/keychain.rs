//! Stakeholder Key Derivation
//!
//! Every stakeholder watches the same ladder of deposit addresses. A deposit
//! at derivation index `i` is locked to the set of public keys obtained by
//! deriving child `i` (non-hardened) of every stakeholder's extended public
//! key, in the fixed configuration order. That order is the basis for
//! deterministic script construction and for signature slot addressing, so it
//! must be identical on every process.

use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::PublicKey;
use secp256k1::{SecretKey, SECP256K1};
use thiserror::Error;

/// Key derivation errors
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("stakeholder slot {0} out of range (have {1} stakeholders)")]
    UnknownSlot(usize, usize),
}

/// Derive the public key of one stakeholder for a deposit index.
pub fn derive_pubkey(xpub: &Xpub, index: u32) -> Result<PublicKey, KeyError> {
    let child = ChildNumber::from_normal_idx(index)
        .map_err(|e| KeyError::InvalidKeyMaterial(e.to_string()))?;
    let derived = xpub
        .derive_pub(SECP256K1, &[child])
        .map_err(|e| KeyError::InvalidKeyMaterial(e.to_string()))?;
    Ok(PublicKey::new(derived.public_key))
}

/// Derive the local private key for a deposit index. Only ever called with
/// this process's own extended private key.
pub fn derive_privkey(xpriv: &Xpriv, index: u32) -> Result<SecretKey, KeyError> {
    let child = ChildNumber::from_normal_idx(index)
        .map_err(|e| KeyError::InvalidKeyMaterial(e.to_string()))?;
    let derived = xpriv
        .derive_priv(SECP256K1, &[child])
        .map_err(|e| KeyError::InvalidKeyMaterial(e.to_string()))?;
    Ok(derived.private_key)
}

/// The fixed, ordered set of protocol participants as seen by one process.
///
/// Holds the extended public key of every stakeholder (ours included, resolved
/// from our extended private key), which subset of slots are managers allowed
/// to initiate spends, and the cosigner's extended public key.
#[derive(Debug, Clone)]
pub struct StakeholderSet {
    xpubs: Vec<Xpub>,
    our_slot: usize,
    our_xpriv: Xpriv,
    manager_slots: Vec<usize>,
    cosigner_xpub: Xpub,
}

impl StakeholderSet {
    /// Build the set from the configured list of xpubs, where the `None`
    /// entry marks this process's own slot and is resolved from `our_xpriv`.
    pub fn new(
        xpubs: Vec<Option<Xpub>>,
        our_xpriv: Xpriv,
        manager_slots: Vec<usize>,
        cosigner_xpub: Xpub,
    ) -> Result<Self, KeyError> {
        let our_slot = xpubs
            .iter()
            .position(|x| x.is_none())
            .ok_or_else(|| KeyError::InvalidKeyMaterial("no slot marked as ours".into()))?;
        if xpubs.iter().filter(|x| x.is_none()).count() != 1 {
            return Err(KeyError::InvalidKeyMaterial(
                "exactly one stakeholder slot must be ours".into(),
            ));
        }

        let our_xpub = Xpub::from_priv(SECP256K1, &our_xpriv);
        let xpubs: Vec<Xpub> = xpubs
            .into_iter()
            .map(|x| x.unwrap_or(our_xpub))
            .collect();

        for slot in &manager_slots {
            if *slot >= xpubs.len() {
                return Err(KeyError::UnknownSlot(*slot, xpubs.len()));
            }
        }

        Ok(Self {
            xpubs,
            our_slot,
            our_xpriv,
            manager_slots,
            cosigner_xpub,
        })
    }

    /// Number of stakeholders.
    pub fn len(&self) -> usize {
        self.xpubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xpubs.is_empty()
    }

    /// Our slot in the fixed ordering.
    pub fn our_slot(&self) -> usize {
        self.our_slot
    }

    /// Whether this process is one of the managers.
    pub fn we_are_manager(&self) -> bool {
        self.manager_slots.contains(&self.our_slot)
    }

    pub fn manager_slots(&self) -> &[usize] {
        &self.manager_slots
    }

    /// All stakeholder public keys at a deposit index, in slot order.
    pub fn pubkeys_at(&self, index: u32) -> Result<Vec<PublicKey>, KeyError> {
        self.xpubs
            .iter()
            .map(|xpub| derive_pubkey(xpub, index))
            .collect()
    }

    /// One stakeholder's public key at a deposit index.
    pub fn pubkey_at(&self, slot: usize, index: u32) -> Result<PublicKey, KeyError> {
        let xpub = self
            .xpubs
            .get(slot)
            .ok_or(KeyError::UnknownSlot(slot, self.xpubs.len()))?;
        derive_pubkey(xpub, index)
    }

    /// Manager public keys at a deposit index, in slot order.
    pub fn manager_pubkeys_at(&self, index: u32) -> Result<Vec<PublicKey>, KeyError> {
        self.manager_slots
            .iter()
            .map(|slot| self.pubkey_at(*slot, index))
            .collect()
    }

    /// The cosigner's public key at a deposit index.
    pub fn cosigner_pubkey_at(&self, index: u32) -> Result<PublicKey, KeyError> {
        derive_pubkey(&self.cosigner_xpub, index)
    }

    /// Our private key at a deposit index.
    pub fn our_privkey_at(&self, index: u32) -> Result<SecretKey, KeyError> {
        derive_privkey(&self.our_xpriv, index)
    }
}
