//! Operator API Endpoints
//!
//! REST surface exposed to operator tooling:
//! - GET  /api/vaults         - List active vaults with status flags
//! - GET  /api/vaults/stats   - Running counters
//! - GET  /api/address        - Hand out a fresh deposit address
//! - POST /api/spend/initiate - Build and co-sign a Spend proposal
//! - POST /api/spend/accept   - Approve a peer's Spend proposal
//! - GET  /api/health         - Health check

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bitcoin::{Amount, OutPoint};
use serde::Deserialize;
use std::str::FromStr;
use tower_http::cors::{Any, CorsLayer};

use crate::service::SharedVaultService;
use crate::spend::SpendProposal;

/// POST /api/spend/initiate request body
#[derive(Debug, Deserialize)]
pub struct InitiateSpendRequest {
    /// Deposit outpoint of the vault to spend, as `txid:vout`.
    pub deposit_outpoint: String,
    pub amount_sats: u64,
    pub destination: String,
}

/// Create the operator API router.
pub fn create_router(service: SharedVaultService) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/vaults", get(handle_list_vaults))
        .route("/api/vaults/stats", get(handle_stats))
        .route("/api/address", get(handle_new_address))
        .route("/api/spend/initiate", post(handle_initiate_spend))
        .route("/api/spend/accept", post(handle_accept_spend))
        .route("/api/health", get(handle_health))
        .layer(cors)
        .with_state(service)
}

/// GET /api/vaults
async fn handle_list_vaults(State(service): State<SharedVaultService>) -> impl IntoResponse {
    let service = service.read().await;
    let vaults = service.list_vaults();
    Json(serde_json::json!({
        "count": vaults.len(),
        "vaults": vaults,
        "retired": service.retired_vaults(),
    }))
}

/// GET /api/vaults/stats
async fn handle_stats(State(service): State<SharedVaultService>) -> impl IntoResponse {
    let service = service.read().await;
    Json(service.stats())
}

/// GET /api/address
async fn handle_new_address(State(service): State<SharedVaultService>) -> impl IntoResponse {
    let mut service = service.write().await;
    match service.get_new_address() {
        Ok(address) => (
            StatusCode::OK,
            Json(serde_json::json!({ "address": address.to_string() })),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// POST /api/spend/initiate
async fn handle_initiate_spend(
    State(service): State<SharedVaultService>,
    Json(req): Json<InitiateSpendRequest>,
) -> impl IntoResponse {
    let outpoint = match OutPoint::from_str(&req.deposit_outpoint) {
        Ok(op) => op,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("bad outpoint: {}", e)),
    };

    let mut service = service.write().await;
    match service
        .initiate_spend(&outpoint, Amount::from_sat(req.amount_sats), &req.destination)
        .await
    {
        Ok(proposal) => (StatusCode::OK, Json(proposal)).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// POST /api/spend/accept
async fn handle_accept_spend(
    State(service): State<SharedVaultService>,
    Json(proposal): Json<SpendProposal>,
) -> impl IntoResponse {
    let mut service = service.write().await;
    match service.accept_spend(&proposal) {
        Ok(sig) => (
            StatusCode::OK,
            Json(serde_json::json!({ "sig": hex::encode(sig) })),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// GET /api/health
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "covault",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

fn error_response(status: StatusCode, details: String) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": details }))).into_response()
}

/// Start the operator API server.
pub async fn start_server(service: SharedVaultService, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(service);
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));

    tracing::info!(target: "covault::api", %addr, "operator API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
