//! Shared test fixtures: an in-memory chain backend and a multi-process
//! harness running several stakeholder services against one relay.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::hashes::Hash;
use bitcoin::{Address, Amount, Network, OutPoint, ScriptBuf, Transaction, Txid};
use secp256k1::SECP256K1;

use covault::chain::{ChainBackend, ChainError, SpendInfo, Utxo};
use covault::cosigner::LocalCosigner;
use covault::relay::MemoryRelay;
use covault::script;
use covault::service::VaultService;
use covault::{Config, StakeholderSet};

// ----------------------------------------------------------------------
// In-memory chain

#[derive(Default)]
struct ChainState {
    /// Confirmed and pending outputs, by scriptPubKey.
    utxos: HashMap<ScriptBuf, Vec<Utxo>>,
    /// Spends of known outpoints.
    outspends: HashMap<OutPoint, SpendInfo>,
    height: u64,
    next_txid: u64,
}

/// A controllable chain: tests fund addresses, broadcast transactions and
/// mine blocks; the services observe the effects through the backend trait.
pub struct FakeChain {
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState {
                height: 100,
                ..ChainState::default()
            }),
        }
    }

    fn fabricate_txid(counter: u64) -> Txid {
        let mut bytes = [0xabu8; 32];
        bytes[..8].copy_from_slice(&counter.to_le_bytes());
        Txid::from_byte_array(bytes)
    }

    /// Pay `sats` to an address in a fabricated, already-confirmed funding
    /// transaction. Returns the created outpoint.
    pub fn fund_address(&self, address: &Address, sats: u64) -> OutPoint {
        let mut state = self.state.lock().unwrap();
        state.next_txid += 1;
        let outpoint = OutPoint::new(Self::fabricate_txid(state.next_txid), 0);
        state
            .utxos
            .entry(address.script_pubkey())
            .or_default()
            .push(Utxo {
                outpoint,
                value: Amount::from_sat(sats),
                confirmations: 6,
            });
        outpoint
    }

    /// Accept a transaction into the mempool: its inputs become spent
    /// (unconfirmed) and its outputs appear as unconfirmed outputs.
    pub fn accept_tx(&self, tx: &Transaction) {
        let txid = tx.compute_txid();
        let mut state = self.state.lock().unwrap();

        for input in &tx.input {
            let prev = input.previous_output;
            state.outspends.insert(
                prev,
                SpendInfo {
                    spending_txid: txid,
                    confirmed: false,
                },
            );
            for utxos in state.utxos.values_mut() {
                utxos.retain(|u| u.outpoint != prev);
            }
        }
        for (vout, output) in tx.output.iter().enumerate() {
            state
                .utxos
                .entry(output.script_pubkey.clone())
                .or_default()
                .push(Utxo {
                    outpoint: OutPoint::new(txid, vout as u32),
                    value: output.value,
                    confirmations: 0,
                });
        }
    }

    /// Mine a block: every pending spend confirms and every output gains a
    /// confirmation.
    pub fn mine(&self) {
        let mut state = self.state.lock().unwrap();
        state.height += 1;
        for spend in state.outspends.values_mut() {
            spend.confirmed = true;
        }
        for utxos in state.utxos.values_mut() {
            for utxo in utxos.iter_mut() {
                utxo.confirmations += 1;
            }
        }
    }

    /// Broadcast-and-mine, as the functional tests do.
    pub fn broadcast_and_mine(&self, tx: &Transaction) {
        self.accept_tx(tx);
        self.mine();
    }
}

#[async_trait]
impl ChainBackend for FakeChain {
    async fn confirmed_utxos(&self, address: &Address) -> Result<Vec<Utxo>, ChainError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .utxos
            .get(&address.script_pubkey())
            .map(|utxos| {
                utxos
                    .iter()
                    .filter(|u| u.confirmations > 0)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn spend_of(&self, outpoint: &OutPoint) -> Result<Option<SpendInfo>, ChainError> {
        Ok(self.state.lock().unwrap().outspends.get(outpoint).copied())
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        self.accept_tx(tx);
        Ok(tx.compute_txid())
    }

    async fn tip_height(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().unwrap().height)
    }
}

// ----------------------------------------------------------------------
// Multi-process harness

pub const STAKEHOLDERS: usize = 4;
pub const MANAGERS: [usize; 2] = [0, 1];
pub const CSV_DELAY: u16 = 6;

/// Several stakeholder processes sharing one chain, one relay and one
/// cosigner, as in the functional test topology.
pub struct Harness {
    pub services: Vec<VaultService>,
    pub chain: Arc<FakeChain>,
    pub relay: Arc<MemoryRelay>,
    pub cosigner: Arc<LocalCosigner>,
    /// A destination outside the watched address ladder.
    pub external_address: Address,
}

impl Harness {
    pub fn new() -> Self {
        let masters: Vec<Xpriv> = (1..=STAKEHOLDERS as u8)
            .map(|s| Xpriv::new_master(Network::Regtest, &[s; 32]).unwrap())
            .collect();
        let cosigner_master = Xpriv::new_master(Network::Regtest, &[0x42; 32]).unwrap();
        let cosigner_xpub = Xpub::from_priv(SECP256K1, &cosigner_master);

        let chain = Arc::new(FakeChain::new());
        let relay = Arc::new(MemoryRelay::new());
        let cosigner = Arc::new(LocalCosigner::new(
            cosigner_master,
            Network::Regtest,
            CSV_DELAY,
        ));

        // A throwaway set to derive the (shared) emergency address.
        let all_xpubs: Vec<Xpub> = masters
            .iter()
            .map(|m| Xpub::from_priv(SECP256K1, m))
            .collect();
        let emergency_keys: Vec<bitcoin::PublicKey> = all_xpubs
            .iter()
            .map(|x| covault::derive_pubkey(x, 999_999).unwrap())
            .collect();
        let emergency_address = script::p2wsh_address(
            &script::deposit_script(&emergency_keys),
            Network::Regtest,
        );

        let services = (0..STAKEHOLDERS)
            .map(|our| {
                let xpubs: Vec<Option<Xpub>> = all_xpubs
                    .iter()
                    .enumerate()
                    .map(|(i, x)| (i != our).then_some(*x))
                    .collect();
                let keys = StakeholderSet::new(
                    xpubs.clone(),
                    masters[our],
                    MANAGERS.to_vec(),
                    cosigner_xpub,
                )
                .unwrap();
                let config = Config {
                    network: Network::Regtest,
                    stakeholder_xpubs: xpubs,
                    xpriv: masters[our],
                    manager_slots: MANAGERS.to_vec(),
                    cosigner_xpub,
                    emergency_address: emergency_address.clone(),
                    csv_delay: CSV_DELAY,
                    derivation_gap: 20,
                    cancel_feerate_factor: 2,
                    required_confirmations: 1,
                    poll_interval_secs: 10,
                    relay_url: String::new(),
                    cosigner_url: String::new(),
                    chain_url: String::new(),
                    api_port: 0,
                    log_level: "info".to_string(),
                };
                VaultService::new(&config, keys, chain.clone(), relay.clone(), cosigner.clone())
            })
            .collect();

        let external_master = Xpriv::new_master(Network::Regtest, &[0x77; 32]).unwrap();
        let external_key =
            bitcoin::CompressedPublicKey(Xpub::from_priv(SECP256K1, &external_master).public_key);
        let external_address = Address::p2wpkh(&external_key, Network::Regtest);

        Self {
            services,
            chain,
            relay,
            cosigner,
            external_address,
        }
    }

    /// Run `rounds` processing cycles on every service, in process order.
    pub async fn cycle(&mut self, rounds: usize) {
        for _ in 0..rounds {
            for service in self.services.iter_mut() {
                service.process_cycle().await;
            }
        }
    }

    /// Active vault outpoints as seen by one process.
    pub fn outpoints(&self, process: usize) -> Vec<OutPoint> {
        self.services[process]
            .list_vaults()
            .iter()
            .map(|entry| OutPoint::from_str(&entry.deposit_outpoint).unwrap())
            .collect()
    }

    /// Register every vault of `process` with the cosigner, as operator
    /// tooling would when a vault becomes spendable.
    pub fn register_cosigner_contexts(&self, process: usize) {
        for outpoint in self.outpoints(process) {
            let context = self.services[process].spend_context(&outpoint).unwrap();
            self.cosigner.register_vault(outpoint, context);
        }
    }

    /// Whether every vault of every process is fully secured.
    pub fn all_secure(&self) -> bool {
        self.services.iter().all(|service| {
            let vaults = service.list_vaults();
            !vaults.is_empty()
                && vaults
                    .iter()
                    .all(|v| v.emergency_signed && v.unvault_signed && v.unvault_secure)
        })
    }
}
