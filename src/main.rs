//! covaultd - Multi-party Bitcoin Custody Daemon
//!
//! Run modes:
//!   covaultd daemon    - Run the vault engine and the operator API
//!   covaultd demo      - Print the first deposit addresses for the config
//!   covaultd help      - Show usage

use std::env;
use std::sync::Arc;

use covault::chain::EsploraBackend;
use covault::cosigner::HttpCosigner;
use covault::relay::HttpRelay;
use covault::service::VaultService;
use covault::{api, logging, service, Config};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("daemon") => run_daemon().await,
        Some("demo") => run_demo(),
        _ => print_usage(),
    }
}

fn print_usage() {
    println!("covaultd - multi-party Bitcoin custody daemon");
    println!();
    println!("Usage:");
    println!("  covaultd daemon    Run the vault engine and operator API");
    println!("  covaultd demo      Print the first deposit addresses");
    println!();
    println!("Configuration is environment-based; see the covault::config docs");
    println!("for the COVAULT_* variables.");
}

fn load_config() -> Config {
    match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_daemon() {
    let config = load_config();
    if let Err(e) = logging::init_from_config(&config) {
        eprintln!("cannot initialize logging: {}", e);
        std::process::exit(1);
    }

    let keys = match config.stakeholder_set() {
        Ok(keys) => keys,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        target: "covault::main",
        stakeholders = keys.len(),
        our_slot = keys.our_slot(),
        manager = keys.we_are_manager(),
        network = %config.network,
        "starting covaultd"
    );

    let backend = Arc::new(EsploraBackend::new(&config.chain_url));
    let relay = Arc::new(HttpRelay::new(&config.relay_url));
    let cosigner = Arc::new(HttpCosigner::new(&config.cosigner_url));

    let shared = VaultService::new(&config, keys, backend, relay, cosigner).into_shared();

    let poller = tokio::spawn(service::run(shared.clone(), config.poll_interval_secs));

    if let Err(e) = api::start_server(shared, config.api_port).await {
        tracing::error!(target: "covault::main", "API server error: {}", e);
    }
    poller.abort();
}

fn run_demo() {
    let config = load_config();
    let keys = match config.stakeholder_set() {
        Ok(keys) => keys,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    println!("=== covault demo ===");
    println!();
    println!(
        "{} stakeholders, we are slot {} ({})",
        keys.len(),
        keys.our_slot(),
        if keys.we_are_manager() {
            "manager"
        } else {
            "stakeholder"
        }
    );
    println!("Network: {}", config.network);
    println!("Emergency address: {}", config.emergency_address);
    println!();
    println!("First deposit addresses:");

    let mut scanner = covault::DepositScanner::new(
        config.network,
        config.derivation_gap,
        config.required_confirmations,
    );
    for _ in 0..5 {
        match scanner.next_address(&keys) {
            Ok((address, index)) => println!("  [{}] {}", index, address),
            Err(e) => {
                eprintln!("derivation error: {}", e);
                std::process::exit(1);
            }
        }
    }
}
