//! Deposit Scanner
//!
//! Watches a window of derived deposit addresses for incoming confirmed
//! funds. The window `[0, watermark + gap)` never shrinks: handing out a new
//! address advances the watermark, and so does seeing funds at an index
//! inside the gap. Detection is order-independent across indices (addresses
//! may be generated much faster than they are funded) and an address is
//! never retired once funded, so a reused address simply yields another
//! independent deposit.

use std::collections::{HashMap, HashSet};

use bitcoin::{Address, Network, OutPoint};
use thiserror::Error;

use crate::chain::{ChainBackend, ChainError};
use crate::keychain::{KeyError, StakeholderSet};
use crate::script;
use crate::vault::Deposit;

/// Scanner errors
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Watches the deposit address ladder and emits new confirmed deposits.
#[derive(Debug)]
pub struct DepositScanner {
    network: Network,
    gap: u32,
    required_confirmations: u32,
    /// One past the highest index handed out or seen funded.
    watermark: u32,
    /// Outpoints already emitted as deposits.
    seen: HashSet<OutPoint>,
}

impl DepositScanner {
    pub fn new(network: Network, gap: u32, required_confirmations: u32) -> Self {
        Self {
            network,
            gap,
            required_confirmations,
            watermark: 0,
            seen: HashSet::new(),
        }
    }

    /// The deposit address for a derivation index.
    pub fn address_at(&self, keys: &StakeholderSet, index: u32) -> Result<Address, KeyError> {
        let pubkeys = keys.pubkeys_at(index)?;
        Ok(script::p2wsh_address(
            &script::deposit_script(&pubkeys),
            self.network,
        ))
    }

    /// Hand out a fresh deposit address, advancing the watermark.
    pub fn next_address(&mut self, keys: &StakeholderSet) -> Result<(Address, u32), KeyError> {
        let index = self.watermark;
        let address = self.address_at(keys, index)?;
        self.watermark += 1;
        Ok((address, index))
    }

    /// Indices currently watched.
    pub fn watched_indices(&self) -> std::ops::Range<u32> {
        0..self.watermark + self.gap
    }

    /// Query the backend for every watched address and emit the deposits not
    /// yet tracked. Seeing funds at an index inside the gap advances the
    /// watermark past it, extending the window.
    pub async fn poll(
        &mut self,
        backend: &dyn ChainBackend,
        keys: &StakeholderSet,
    ) -> Result<Vec<Deposit>, ScanError> {
        let mut addresses: HashMap<u32, Address> = HashMap::new();
        for index in self.watched_indices() {
            addresses.insert(index, self.address_at(keys, index)?);
        }

        let mut deposits = Vec::new();
        for (index, address) in addresses {
            let utxos = backend.confirmed_utxos(&address).await?;
            for utxo in utxos {
                if utxo.confirmations < self.required_confirmations {
                    continue;
                }
                if !self.seen.insert(utxo.outpoint) {
                    continue;
                }
                if index >= self.watermark {
                    self.watermark = index + 1;
                }
                tracing::info!(
                    target: "covault::scanner",
                    outpoint = %utxo.outpoint,
                    index,
                    value = utxo.value.to_sat(),
                    "new deposit detected"
                );
                deposits.push(Deposit {
                    outpoint: utxo.outpoint,
                    amount: utxo.value,
                    derivation_index: index,
                });
            }
        }

        deposits.sort_by_key(|d| (d.derivation_index, d.outpoint));
        Ok(deposits)
    }

    /// Claim an outpoint that was tracked out of band (a Cancel replacement)
    /// so it is not re-emitted as a fresh deposit.
    pub fn mark_seen(&mut self, outpoint: OutPoint) {
        self.seen.insert(outpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainBackend, Utxo};
    use bitcoin::bip32::{Xpriv, Xpub};
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, Txid};
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

    fn txid(n: u8) -> Txid {
        Txid::from_byte_array([n; 32])
    }

    fn backend_with(funded: Vec<(Address, Utxo)>) -> MockChainBackend {
        let mut backend = MockChainBackend::new();
        backend.expect_confirmed_utxos().returning(move |addr| {
            Ok(funded
                .iter()
                .filter(|(a, _)| a == addr)
                .map(|(_, u)| u.clone())
                .collect())
        });
        backend
    }

    #[test]
    fn window_never_shrinks() {
        let keys = keys();
        let mut scanner = DepositScanner::new(Network::Regtest, 20, 1);
        assert_eq!(scanner.watched_indices(), 0..20);

        for _ in 0..5 {
            scanner.next_address(&keys).unwrap();
        }
        assert_eq!(scanner.watched_indices(), 0..25);
    }

    #[tokio::test]
    async fn detects_funds_across_the_gap() {
        let keys = keys();
        let mut scanner = DepositScanner::new(Network::Regtest, 20, 1);

        // Fund indices 0..3, then skip to 22 (as if 20 addresses were
        // generated elsewhere without being funded).
        let mut funded = Vec::new();
        for i in 0..3u8 {
            funded.push((
                scanner.address_at(&keys, i as u32).unwrap(),
                Utxo {
                    outpoint: OutPoint::new(txid(i), 0),
                    value: Amount::from_sat(10_000_000),
                    confirmations: 1,
                },
            ));
        }
        let backend = backend_with(funded);
        let deposits = scanner.poll(&backend, &keys).await.unwrap();
        assert_eq!(deposits.len(), 3);
        // Watermark advanced past the funded indices; window extends.
        assert_eq!(scanner.watched_indices(), 0..23);

        // Index 22 is inside the window even though 3..22 are unused.
        let funded = vec![
            (
                scanner.address_at(&keys, 22).unwrap(),
                Utxo {
                    outpoint: OutPoint::new(txid(22), 0),
                    value: Amount::from_sat(10_000_000),
                    confirmations: 1,
                },
            ),
            (
                scanner.address_at(&keys, 21).unwrap(),
                Utxo {
                    outpoint: OutPoint::new(txid(21), 1),
                    value: Amount::from_sat(10_000_000),
                    confirmations: 1,
                },
            ),
        ];
        let backend = backend_with(funded);
        let deposits = scanner.poll(&backend, &keys).await.unwrap();
        assert_eq!(deposits.len(), 2);
        assert_eq!(scanner.watched_indices(), 0..43);
    }

    #[tokio::test]
    async fn address_reuse_yields_independent_deposits() {
        let keys = keys();
        let mut scanner = DepositScanner::new(Network::Regtest, 20, 1);
        let address = scanner.address_at(&keys, 0).unwrap();

        let funded: Vec<(Address, Utxo)> = (0..5u8)
            .map(|i| {
                (
                    address.clone(),
                    Utxo {
                        outpoint: OutPoint::new(txid(i), 0),
                        value: Amount::from_sat(12_000_000),
                        confirmations: 1,
                    },
                )
            })
            .collect();
        let backend = backend_with(funded);

        let deposits = scanner.poll(&backend, &keys).await.unwrap();
        assert_eq!(deposits.len(), 5);
        assert!(deposits.iter().all(|d| d.derivation_index == 0));

        // A second poll re-reports nothing.
        let deposits = scanner.poll(&backend, &keys).await.unwrap();
        assert!(deposits.is_empty());
    }

    #[tokio::test]
    async fn unconfirmed_outputs_are_ignored() {
        let keys = keys();
        let mut scanner = DepositScanner::new(Network::Regtest, 20, 2);
        let funded = vec![(
            scanner.address_at(&keys, 0).unwrap(),
            Utxo {
                outpoint: OutPoint::new(txid(1), 0),
                value: Amount::from_sat(10_000_000),
                confirmations: 1,
            },
        )];
        let backend = backend_with(funded);
        let deposits = scanner.poll(&backend, &keys).await.unwrap();
        assert!(deposits.is_empty());
    }

    #[tokio::test]
    async fn claimed_outpoints_are_not_emitted() {
        let keys = keys();
        let mut scanner = DepositScanner::new(Network::Regtest, 20, 1);
        let outpoint = OutPoint::new(txid(1), 0);
        let funded = vec![(
            scanner.address_at(&keys, 0).unwrap(),
            Utxo {
                outpoint,
                value: Amount::from_sat(10_000_000),
                confirmations: 1,
            },
        )];
        let backend = backend_with(funded);

        scanner.mark_seen(outpoint);
        let deposits = scanner.poll(&backend, &keys).await.unwrap();
        assert!(deposits.is_empty());
    }
}
