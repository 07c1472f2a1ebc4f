//! End-to-end lifecycle scenarios: several stakeholder processes over one
//! relay and one simulated chain, mirroring the deployment topology.

mod common;

use bitcoin::consensus::encode::serialize;
use bitcoin::Amount;

use common::Harness;
use covault::{CovaultError, SpendError, TxKind, VaultStatus};

const DEPOSIT_SATS: u64 = 1_000_000_000; // 10 BTC

#[tokio::test]
async fn deposit_addresses_match_across_processes() {
    let mut h = Harness::new();

    for _ in 0..3 {
        let addresses: Vec<String> = h
            .services
            .iter_mut()
            .map(|s| s.get_new_address().unwrap().to_string())
            .collect();
        assert!(addresses.windows(2).all(|w| w[0] == w[1]));
    }
}

#[tokio::test]
async fn funds_polling_tolerates_the_gap() {
    let mut h = Harness::new();

    // Three funded addresses.
    for _ in 0..3 {
        let address = h.services[0].get_new_address().unwrap();
        h.chain.fund_address(&address, DEPOSIT_SATS);
    }
    h.cycle(1).await;
    assert_eq!(h.services[0].vault_count(), 3);

    // Generate a pile of unused addresses, then fund two more: detection is
    // order-independent inside the gap window.
    for _ in 0..20 {
        h.services[0].get_new_address().unwrap();
    }
    for _ in 0..2 {
        let address = h.services[0].get_new_address().unwrap();
        h.chain.fund_address(&address, DEPOSIT_SATS);
    }
    h.cycle(1).await;
    assert_eq!(h.services[0].vault_count(), 5);
}

#[tokio::test]
async fn every_process_tracks_every_deposit() {
    let mut h = Harness::new();

    // Deposits made via one process's addresses are remarked by everyone.
    for _ in 0..3 {
        let address = h.services[0].get_new_address().unwrap();
        h.chain.fund_address(&address, DEPOSIT_SATS);
    }
    h.cycle(1).await;

    for service in &h.services {
        assert_eq!(service.vault_count(), 3);
    }
}

#[tokio::test]
async fn signature_exchange_secures_vaults() {
    let mut h = Harness::new();

    let address = h.services[0].get_new_address().unwrap();
    h.chain.fund_address(&address, DEPOSIT_SATS);

    // First cycle: everyone signs and submits. Second: everyone has all
    // peers' signatures.
    h.cycle(2).await;
    assert!(h.all_secure());

    // 4 transactions, one relay slot per stakeholder each.
    assert_eq!(h.relay.stored_count(), 4 * common::STAKEHOLDERS);

    // Emergency transactions are bit-for-bit identical across processes,
    // witness included.
    let outpoint = h.outpoints(0)[0];
    let reference = serialize(
        h.services[0]
            .vault(&outpoint)
            .unwrap()
            .emergency
            .finalized
            .as_ref()
            .unwrap(),
    );
    for service in &h.services[1..] {
        let tx = service.vault(&outpoint).unwrap();
        assert_eq!(serialize(tx.emergency.finalized.as_ref().unwrap()), reference);
    }
}

#[tokio::test]
async fn address_reuse_yields_independent_vaults() {
    let mut h = Harness::new();

    let address = h.services[0].get_new_address().unwrap();
    for _ in 0..5 {
        h.chain.fund_address(&address, 12 * 100_000_000);
    }
    h.cycle(2).await;

    for service in &h.services {
        assert_eq!(service.vault_count(), 5);
        assert!(service.list_vaults().iter().all(|v| v.derivation_index == 0));
    }
    assert!(h.all_secure());
}

#[tokio::test]
async fn emergency_broadcast_retires_vaults() {
    let mut h = Harness::new();

    for _ in 0..2 {
        let address = h.services[0].get_new_address().unwrap();
        h.chain.fund_address(&address, DEPOSIT_SATS);
    }
    h.cycle(2).await;
    assert!(h.all_secure());

    // Any single process can broadcast the emergencies it holds.
    for outpoint in h.outpoints(1) {
        h.services[1]
            .broadcast_presigned(&outpoint, TxKind::Emergency)
            .await
            .unwrap();
    }
    h.chain.mine();
    h.cycle(1).await;

    for service in &h.services {
        assert_eq!(service.vault_count(), 0);
    }
}

#[tokio::test]
async fn unvault_then_spend_path_retires_vaults() {
    let mut h = Harness::new();

    let address = h.services[0].get_new_address().unwrap();
    h.chain.fund_address(&address, DEPOSIT_SATS);
    h.cycle(2).await;
    assert!(h.all_secure());

    let outpoint = h.outpoints(0)[0];
    h.services[0]
        .broadcast_presigned(&outpoint, TxKind::Unvault)
        .await
        .unwrap();
    h.chain.mine();
    h.cycle(1).await;

    for service in &h.services {
        assert_eq!(
            service.vault(&outpoint).unwrap().status,
            VaultStatus::Spending
        );
    }

    // The unvault-emergency covers the post-unvault window; confirming it
    // retires the vault with no replacement.
    h.services[0]
        .broadcast_presigned(&outpoint, TxKind::UnvaultEmergency)
        .await
        .unwrap();
    h.chain.mine();
    h.cycle(1).await;

    for service in &h.services {
        assert_eq!(service.vault_count(), 0);
    }
}

#[tokio::test]
async fn cancel_confirmation_creates_one_replacement() {
    let mut h = Harness::new();

    for _ in 0..2 {
        let address = h.services[0].get_new_address().unwrap();
        h.chain.fund_address(&address, DEPOSIT_SATS);
    }
    h.cycle(2).await;
    assert!(h.all_secure());

    let victim = h.outpoints(0)[0];
    let cancel_txid = h.services[0].vault(&victim).unwrap().cancel.txid();

    h.services[0]
        .broadcast_presigned(&victim, TxKind::Unvault)
        .await
        .unwrap();
    h.chain.mine();
    h.cycle(1).await;
    h.services[0]
        .broadcast_presigned(&victim, TxKind::Cancel)
        .await
        .unwrap();
    h.chain.mine();
    h.cycle(1).await;

    // Same total, one retired, one created, on every process.
    for (i, service) in h.services.iter().enumerate() {
        assert_eq!(service.vault_count(), 2, "process {}", i);
        assert!(service.vault(&victim).is_none());
        let replacement = bitcoin::OutPoint::new(cancel_txid, 0);
        assert!(service.vault(&replacement).is_some());
    }

    // The replacement re-enters the signing pipeline and becomes secure.
    h.cycle(2).await;
    assert!(h.all_secure());
}

#[tokio::test]
async fn spend_negotiation_completes() {
    let mut h = Harness::new();

    let address = h.services[0].get_new_address().unwrap();
    h.chain.fund_address(&address, DEPOSIT_SATS);
    h.cycle(2).await;
    assert!(h.all_secure());
    h.register_cosigner_contexts(0);

    let outpoint = h.outpoints(0)[0];
    let destination = h.external_address.to_string();
    let amount = Amount::from_sat(DEPOSIT_SATS - 50_000_000);

    // Manager 0 initiates, manager 1 approves by reconstruction.
    let proposal = h.services[0]
        .initiate_spend(&outpoint, amount, &destination)
        .await
        .unwrap();
    let peer_sig = h.services[1].accept_spend(&proposal).unwrap();
    let spend_tx = h.services[0]
        .complete_spend(&outpoint, [(1usize, peer_sig)])
        .unwrap();
    assert_eq!(spend_tx.compute_txid(), proposal.spend_txid);

    // Unvault confirms, the CSV matures, the spend confirms: the vault is
    // gone everywhere.
    h.services[0]
        .broadcast_presigned(&outpoint, TxKind::Unvault)
        .await
        .unwrap();
    h.chain.mine();
    h.cycle(1).await;
    h.chain.broadcast_and_mine(&spend_tx);
    h.cycle(1).await;

    for service in &h.services {
        assert_eq!(service.vault_count(), 0);
    }
}

#[tokio::test]
async fn spend_with_tampered_destination_is_rejected() {
    let mut h = Harness::new();

    let address = h.services[0].get_new_address().unwrap();
    h.chain.fund_address(&address, DEPOSIT_SATS);
    h.cycle(2).await;
    h.register_cosigner_contexts(0);

    let outpoint = h.outpoints(0)[0];
    let destination = h.external_address.to_string();
    let amount = Amount::from_sat(DEPOSIT_SATS - 50_000_000);

    let mut proposal = h.services[0]
        .initiate_spend(&outpoint, amount, &destination)
        .await
        .unwrap();

    // A tampered proposal reconstructs to a different transaction; the
    // approver refuses and produces no signature.
    proposal.destination = h.services[0].get_new_address().unwrap().to_string();
    let err = h.services[1].accept_spend(&proposal).unwrap_err();
    assert!(matches!(
        err,
        CovaultError::Spend(SpendError::SpendMismatch { .. })
    ));
}

#[tokio::test]
async fn cosigner_signs_a_vault_only_once() {
    let mut h = Harness::new();

    let address = h.services[0].get_new_address().unwrap();
    h.chain.fund_address(&address, DEPOSIT_SATS);
    h.cycle(2).await;
    h.register_cosigner_contexts(0);

    let outpoint = h.outpoints(0)[0];
    let destination = h.external_address.to_string();
    let amount = Amount::from_sat(DEPOSIT_SATS - 50_000_000);

    h.services[0]
        .initiate_spend(&outpoint, amount, &destination)
        .await
        .unwrap();

    // A second authorization attempt for the same vault is refused.
    let err = h.services[0]
        .initiate_spend(&outpoint, amount, &destination)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CovaultError::Spend(SpendError::CosignerRejected(_))
    ));
}
