//! Vault Service
//!
//! Owns the in-memory arena of vaults and drives the three polling cycles:
//! deposit scanning, signature synchronization and chain-event observation.
//! The service is shared behind an `RwLock`; every cycle and every mutating
//! command runs under the write lock, so vault mutation is single-writer and
//! retirement/replacement is atomic with respect to any concurrent status
//! read. A failed step leaves the affected vault in its last valid state and
//! is retried on the next cycle.

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::{Address, Amount, OutPoint, Transaction, Txid};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};

use crate::chain::ChainBackend;
use crate::common::error::{CovaultError, Result};
use crate::config::Config;
use crate::coordinator;
use crate::cosigner::{Cosigner, CosignerResponse, SpendContext};
use crate::keychain::StakeholderSet;
use crate::relay::SignatureRelay;
use crate::scanner::DepositScanner;
use crate::spend::{self, SpendError, SpendProposal};
use crate::txchain::{self, ChainFeerates, ChainParams, TxChainError, TxKind};
use crate::vault::{Deposit, RetireReason, RetiredVault, Vault, VaultStatus};

/// Running counters for the operator surface.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct VaultStats {
    pub detected: u64,
    pub secured: u64,
    pub retired: u64,
    pub replaced: u64,
}

/// Projection of a vault for the query surface.
#[derive(Debug, Clone, Serialize)]
pub struct VaultEntry {
    pub deposit_outpoint: String,
    pub derivation_index: u32,
    pub amount_sats: u64,
    pub status: VaultStatus,
    pub emergency_signed: bool,
    pub unvault_signed: bool,
    pub unvault_secure: bool,
    pub unvault_txid: String,
    pub cancel_txid: String,
    pub emergency_txid: String,
    pub unvault_emergency_txid: String,
    pub spend_txid: Option<String>,
}

impl From<&Vault> for VaultEntry {
    fn from(vault: &Vault) -> Self {
        Self {
            deposit_outpoint: vault.outpoint().to_string(),
            derivation_index: vault.deposit.derivation_index,
            amount_sats: vault.deposit.amount.to_sat(),
            status: vault.status,
            emergency_signed: vault.emergency_signed(),
            unvault_signed: vault.unvault_signed(),
            unvault_secure: vault.unvault_secure(),
            unvault_txid: vault.unvault.txid().to_string(),
            cancel_txid: vault.cancel.txid().to_string(),
            emergency_txid: vault.emergency.txid().to_string(),
            unvault_emergency_txid: vault.unvault_emergency.txid().to_string(),
            spend_txid: vault
                .spend
                .as_ref()
                .map(|s| s.proposal.spend_txid.to_string()),
        }
    }
}

/// One stakeholder process's view of the protocol.
pub struct VaultService {
    keys: StakeholderSet,
    params: ChainParams,
    scanner: DepositScanner,
    backend: Arc<dyn ChainBackend>,
    relay: Arc<dyn SignatureRelay>,
    cosigner: Arc<dyn Cosigner>,
    vaults: HashMap<OutPoint, Vault>,
    /// Deposits whose chain could not be built yet (feerate oracle down);
    /// retried every cycle.
    pending: Vec<Deposit>,
    retired: Vec<RetiredVault>,
    stats: VaultStats,
}

/// Shared service handle for the pollers and the API.
pub type SharedVaultService = Arc<RwLock<VaultService>>;

impl VaultService {
    pub fn new(
        config: &Config,
        keys: StakeholderSet,
        backend: Arc<dyn ChainBackend>,
        relay: Arc<dyn SignatureRelay>,
        cosigner: Arc<dyn Cosigner>,
    ) -> Self {
        let params = ChainParams {
            network: config.network,
            csv_delay: config.csv_delay,
            emergency_address: config.emergency_address.clone(),
            cancel_feerate_factor: config.cancel_feerate_factor,
        };
        let scanner = DepositScanner::new(
            config.network,
            config.derivation_gap,
            config.required_confirmations,
        );
        Self {
            keys,
            params,
            scanner,
            backend,
            relay,
            cosigner,
            vaults: HashMap::new(),
            pending: Vec::new(),
            retired: Vec::new(),
            stats: VaultStats::default(),
        }
    }

    pub fn into_shared(self) -> SharedVaultService {
        Arc::new(RwLock::new(self))
    }

    // ------------------------------------------------------------------
    // Query surface

    /// Hand out a fresh deposit address.
    pub fn get_new_address(&mut self) -> Result<Address> {
        let (address, index) = self.scanner.next_address(&self.keys)?;
        tracing::debug!(target: "covault::service", %address, index, "new deposit address");
        Ok(address)
    }

    /// Active vaults, in deposit order.
    pub fn list_vaults(&self) -> Vec<VaultEntry> {
        let mut entries: Vec<(u32, String, VaultEntry)> = self
            .vaults
            .values()
            .map(|v| {
                (
                    v.deposit.derivation_index,
                    v.outpoint().to_string(),
                    VaultEntry::from(v),
                )
            })
            .collect();
        entries.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        entries.into_iter().map(|(_, _, e)| e).collect()
    }

    pub fn vault_count(&self) -> usize {
        self.vaults.len()
    }

    pub fn vault(&self, outpoint: &OutPoint) -> Option<&Vault> {
        self.vaults.get(outpoint)
    }

    pub fn retired_vaults(&self) -> &[RetiredVault] {
        &self.retired
    }

    pub fn stats(&self) -> VaultStats {
        self.stats
    }

    /// The reconstruction context a cosigner needs for one of our vaults.
    pub fn spend_context(&self, outpoint: &OutPoint) -> Result<SpendContext> {
        let vault = self
            .vaults
            .get(outpoint)
            .ok_or(CovaultError::UnknownVault(*outpoint))?;
        Ok(SpendContext {
            unvault_outpoint: vault.unvault_outpoint(),
            unvault_value: vault.unvault.chain_tx.tx.output[0].value,
            unvault_script: vault.unvault_script.clone(),
            derivation_index: vault.deposit.derivation_index,
        })
    }

    // ------------------------------------------------------------------
    // Polling cycles

    /// Run one full processing cycle. Transient failures are logged and
    /// retried on the next cycle; they never tear down the service.
    pub async fn process_cycle(&mut self) {
        if let Err(e) = self.scan_deposits().await {
            tracing::warn!(target: "covault::service", retryable = e.is_retryable(), "deposit scan failed: {}", e);
        }
        self.sync_signatures().await;
        self.watch_chain().await;
    }

    /// Detect new confirmed deposits and build their transaction chains.
    async fn scan_deposits(&mut self) -> Result<()> {
        let mut deposits = std::mem::take(&mut self.pending);
        deposits.extend(self.scanner.poll(&*self.backend, &self.keys).await?);

        for deposit in deposits {
            self.track_deposit(deposit).await;
        }
        Ok(())
    }

    /// Build the chain for a deposit and create its vault entry. A deposit
    /// whose feerates are unavailable stays pending rather than being built
    /// with a guessed rate.
    async fn track_deposit(&mut self, deposit: Deposit) {
        if self.vaults.contains_key(&deposit.outpoint) {
            return;
        }

        let feerates = match ChainFeerates::fetch(
            &*self.relay,
            &deposit.outpoint.txid,
            self.params.cancel_feerate_factor,
        )
        .await
        {
            Ok(feerates) => feerates,
            Err(e @ TxChainError::FeerateUnavailable(_, _)) => {
                tracing::warn!(
                    target: "covault::service",
                    outpoint = %deposit.outpoint,
                    "chain building deferred: {}",
                    e
                );
                self.pending.push(deposit);
                return;
            }
            Err(e) => {
                tracing::error!(target: "covault::service", outpoint = %deposit.outpoint, "cannot build chain: {}", e);
                return;
            }
        };

        match txchain::build_chain(&deposit, &self.keys, &self.params, feerates) {
            Ok(chain) => {
                let vault = Vault::new(deposit, chain);
                tracing::info!(
                    target: "covault::service",
                    outpoint = %deposit.outpoint,
                    index = deposit.derivation_index,
                    value = deposit.amount.to_sat(),
                    "vault created"
                );
                self.vaults.insert(deposit.outpoint, vault);
                self.stats.detected += 1;
            }
            Err(e) => {
                // Dust and key errors are permanent; drop the deposit.
                tracing::error!(target: "covault::service", outpoint = %deposit.outpoint, "refusing deposit: {}", e);
            }
        }
    }

    /// Advance signature collection for every vault still in the signing
    /// pipeline.
    async fn sync_signatures(&mut self) {
        let keys = &self.keys;
        let relay = &*self.relay;
        let mut newly_secured = 0;

        for vault in self.vaults.values_mut().filter(|v| v.is_signing()) {
            let index = vault.deposit.derivation_index;
            let was_secure = vault.unvault_secure();

            for kind in [
                TxKind::Emergency,
                TxKind::Unvault,
                TxKind::Cancel,
                TxKind::UnvaultEmergency,
            ] {
                let ptx = vault.presigned_mut(kind).expect("chain kinds only");
                if ptx.is_complete() {
                    continue;
                }
                if !ptx.submitted {
                    if let Err(e) = coordinator::sign_and_submit(ptx, keys, index, relay).await {
                        tracing::warn!(target: "covault::service", kind = %kind, "signature submission failed, will retry: {}", e);
                        continue;
                    }
                }
                if let Err(e) = coordinator::poll_peers(ptx, keys, index, relay).await {
                    tracing::warn!(target: "covault::service", kind = %kind, "signature poll failed, will retry: {}", e);
                }
            }

            vault.refresh_status();
            if !was_secure && vault.unvault_secure() {
                newly_secured += 1;
            }
        }
        self.stats.secured += newly_secured;
    }

    /// Observe confirmed spends of our deposits and unvault outputs, and
    /// retire or replace vaults accordingly. These events can arrive in any
    /// order relative to signing progress.
    async fn watch_chain(&mut self) {
        let outpoints: Vec<OutPoint> = self.vaults.keys().copied().collect();

        for outpoint in outpoints {
            if let Err(e) = self.watch_vault(outpoint).await {
                tracing::warn!(
                    target: "covault::service",
                    %outpoint,
                    retryable = e.is_retryable(),
                    "chain watch failed, will retry: {}",
                    e
                );
            }
        }
    }

    async fn watch_vault(&mut self, outpoint: OutPoint) -> Result<()> {
        let (unvault_txid, cancel_txid, emergency_txid, unvault_emergency_txid, unvault_outpoint) = {
            let vault = match self.vaults.get(&outpoint) {
                Some(v) => v,
                None => return Ok(()),
            };
            (
                vault.unvault.txid(),
                vault.cancel.txid(),
                vault.emergency.txid(),
                vault.unvault_emergency.txid(),
                vault.unvault_outpoint(),
            )
        };

        // The deposit outpoint is spent by either our Unvault or Emergency.
        if let Some(info) = self.backend.spend_of(&outpoint).await? {
            if info.spending_txid == unvault_txid {
                let vault = self.vaults.get_mut(&outpoint).expect("checked above");
                if vault.is_signing() {
                    tracing::info!(target: "covault::service", %outpoint, "unvault transaction on-chain");
                    vault.mark_spending();
                }
            } else if info.spending_txid == emergency_txid {
                if info.confirmed {
                    self.retire(outpoint, RetireReason::Emergencied, info.spending_txid);
                    return Ok(());
                }
                let vault = self.vaults.get_mut(&outpoint).expect("checked above");
                vault.mark_emergency_broadcast();
            } else if info.confirmed {
                tracing::warn!(
                    target: "covault::service",
                    %outpoint,
                    txid = %info.spending_txid,
                    "deposit spent by a transaction we did not pre-sign"
                );
                self.retire(outpoint, RetireReason::External, info.spending_txid);
                return Ok(());
            }
        }

        // Once unvaulted, the unvault output is spent by Cancel,
        // Unvault-Emergency or the final Spend.
        let unvaulted = !matches!(
            self.vaults
                .get(&outpoint)
                .map(|v| v.status)
                .unwrap_or(VaultStatus::Retired),
            VaultStatus::Detected
                | VaultStatus::EmergencySigned
                | VaultStatus::UnvaultSigned
                | VaultStatus::Secure
                | VaultStatus::Retired
        );
        if !unvaulted {
            return Ok(());
        }

        if let Some(info) = self.backend.spend_of(&unvault_outpoint).await? {
            if info.spending_txid == cancel_txid {
                if info.confirmed {
                    self.replace_cancelled(outpoint, info.spending_txid).await;
                } else {
                    let vault = self.vaults.get_mut(&outpoint).expect("checked above");
                    vault.mark_cancelling();
                }
            } else if info.spending_txid == unvault_emergency_txid {
                if info.confirmed {
                    self.retire(outpoint, RetireReason::UnvaultEmergencied, info.spending_txid);
                } else {
                    let vault = self.vaults.get_mut(&outpoint).expect("checked above");
                    vault.mark_emergency_broadcast();
                }
            } else if info.confirmed {
                self.retire(outpoint, RetireReason::Spent, info.spending_txid);
            }
        }
        Ok(())
    }

    /// Retire a vault: remove it from the active set atomically with respect
    /// to readers.
    fn retire(&mut self, outpoint: OutPoint, reason: RetireReason, spending_txid: Txid) {
        if let Some(mut vault) = self.vaults.remove(&outpoint) {
            vault.mark_retired();
            tracing::info!(
                target: "covault::service",
                %outpoint,
                ?reason,
                txid = %spending_txid,
                "vault retired"
            );
            self.retired.push(RetiredVault {
                deposit_outpoint: outpoint.to_string(),
                reason,
                spending_txid: spending_txid.to_string(),
            });
            self.stats.retired += 1;
        }
    }

    /// A confirmed Cancel retires its vault and creates exactly one
    /// replacement against the Cancel output, which pays the same deposit
    /// script and re-enters the pipeline from scratch.
    async fn replace_cancelled(&mut self, outpoint: OutPoint, cancel_txid: Txid) {
        let replacement = self.vaults.get(&outpoint).map(|vault| Deposit {
            outpoint: OutPoint::new(cancel_txid, 0),
            amount: vault.cancel.chain_tx.tx.output[0].value,
            derivation_index: vault.deposit.derivation_index,
        });

        self.retire(outpoint, RetireReason::Cancelled, cancel_txid);

        if let Some(deposit) = replacement {
            // The cancel output pays a watched address; claim it here so the
            // scanner does not double-track it.
            self.scanner.mark_seen(deposit.outpoint);
            self.track_deposit(deposit).await;
            self.stats.replaced += 1;
        }
    }

    // ------------------------------------------------------------------
    // Spend negotiation and broadcast

    /// Initiator side: build and sign a Spend for one of our vaults and get
    /// the cosigner's signature. Returns the proposal to send to the peer
    /// managers.
    pub async fn initiate_spend(
        &mut self,
        outpoint: &OutPoint,
        amount: Amount,
        destination: &str,
    ) -> Result<SpendProposal> {
        let vault = self
            .vaults
            .get(outpoint)
            .ok_or(CovaultError::UnknownVault(*outpoint))?;

        let mut state = spend::initiate(
            vault,
            &self.keys,
            amount,
            destination,
            self.params.network,
            self.params.csv_delay,
        )?;

        match self.cosigner.request_spend_signature(&state.proposal).await? {
            CosignerResponse::Signature(sig) => state.cosigner_sig = Some(sig),
            CosignerResponse::Rejected(reason) => {
                return Err(SpendError::CosignerRejected(reason).into());
            }
        }

        let proposal = state.proposal.clone();
        tracing::info!(
            target: "covault::spend",
            outpoint = %outpoint,
            spend_txid = %proposal.spend_txid,
            amount = proposal.amount,
            "spend initiated"
        );
        let vault = self.vaults.get_mut(outpoint).expect("checked above");
        vault.spend = Some(state);
        Ok(proposal)
    }

    /// Approver side: reconstruct the proposed Spend and return our
    /// signature only if it matches.
    pub fn accept_spend(&mut self, proposal: &SpendProposal) -> Result<Vec<u8>> {
        let vault = self
            .vaults
            .get(&proposal.deposit_outpoint)
            .ok_or(CovaultError::UnknownVault(proposal.deposit_outpoint))?;

        let sig = spend::approve(
            vault,
            proposal,
            &self.keys,
            self.params.network,
            self.params.csv_delay,
        )?;

        tracing::info!(
            target: "covault::spend",
            outpoint = %proposal.deposit_outpoint,
            spend_txid = %proposal.spend_txid,
            "spend approved"
        );
        Ok(sig)
    }

    /// Initiator side: merge the peers' signatures and assemble the final
    /// witness.
    pub fn complete_spend(
        &mut self,
        outpoint: &OutPoint,
        peer_sigs: impl IntoIterator<Item = (usize, Vec<u8>)>,
    ) -> Result<Transaction> {
        let derivation_index;
        {
            let vault = self
                .vaults
                .get(outpoint)
                .ok_or(CovaultError::UnknownVault(*outpoint))?;
            derivation_index = vault.deposit.derivation_index;
        }

        let vault = self.vaults.get_mut(outpoint).expect("checked above");
        let state = vault
            .spend
            .as_mut()
            .ok_or(CovaultError::Spend(SpendError::NotUnvaultSigned))?;
        for (slot, sig) in peer_sigs {
            state.manager_sigs.insert(slot, sig);
        }

        Ok(spend::complete(state, &self.keys, derivation_index)?)
    }

    /// Broadcast a fully signed pre-signed transaction of a vault.
    pub async fn broadcast_presigned(&self, outpoint: &OutPoint, kind: TxKind) -> Result<Txid> {
        let vault = self
            .vaults
            .get(outpoint)
            .ok_or(CovaultError::UnknownVault(*outpoint))?;
        let ptx = vault
            .presigned(kind)
            .ok_or(CovaultError::NotFullySigned(kind, *outpoint))?;
        let tx = ptx
            .finalized
            .as_ref()
            .ok_or(CovaultError::NotFullySigned(kind, *outpoint))?;
        Ok(self.backend.broadcast(tx).await?)
    }

    /// Broadcast a completed Spend transaction.
    pub async fn broadcast_spend(&self, outpoint: &OutPoint) -> Result<Txid> {
        let vault = self
            .vaults
            .get(outpoint)
            .ok_or(CovaultError::UnknownVault(*outpoint))?;
        let tx = vault
            .spend
            .as_ref()
            .and_then(|s| s.finalized.as_ref())
            .ok_or(CovaultError::NotFullySigned(TxKind::Spend, *outpoint))?;
        Ok(self.backend.broadcast(tx).await?)
    }
}

/// Drive a shared service's polling cycles until the task is aborted.
pub async fn run(service: SharedVaultService, poll_interval_secs: u64) {
    let mut ticker = interval(Duration::from_secs(poll_interval_secs));
    loop {
        ticker.tick().await;
        service.write().await.process_cycle().await;
    }
}
