//! HTTP API for health checks, swap requests and status reporting
//!
//! Read-only status surface for operators/UIs plus the user entry point
//! for requesting a swap.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::error::SwapResult;
use crate::protocol::{SwapId, SwapParameters};
use crate::state::SwapStore;
use crate::swap::SwapManager;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SwapManager>,
    pub chain_manager: Arc<ChainManager>,
    pub store: Option<Arc<dyn SwapStore>>,
}

/// Run the HTTP API server
pub async fn run_server(
    config: ApiConfig,
    manager: Arc<SwapManager>,
    chain_manager: Arc<ChainManager>,
    store: Option<Arc<dyn SwapStore>>,
) -> SwapResult<()> {
    let state = AppState {
        manager,
        chain_manager,
        store,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/swaps", get(list_swaps).post(request_swap))
        .route("/swaps/:id", get(get_swap))
        .route("/swaps/:id/cancel", post(cancel_swap))
        .route("/stats", get(get_stats))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| crate::error::SwapError::Internal(e.to_string()))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::SwapError::Internal(e.to_string()))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify chains and storage
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = match &state.store {
        Some(store) => store.health_check().await.is_ok(),
        None => true,
    };

    let chain_health = state.chain_manager.health_check().await;
    let chains_ok = !chain_health.is_empty() && chain_health.iter().all(|(_, h)| *h);

    let response = ReadinessResponse {
        ready: store_ok && chains_ok,
        storage: store_ok,
        chains: chain_health
            .into_iter()
            .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
            .collect(),
    };

    let code = if response.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

/// Request a new swap (user entry point)
async fn request_swap(
    State(state): State<AppState>,
    Json(request): Json<SwapRequest>,
) -> impl IntoResponse {
    let params = SwapParameters {
        chain_a: request.chain_a,
        amount_a: request.amount_a,
        timeout_a: request.timeout_a,
        chain_b: request.chain_b,
        amount_b: request.amount_b,
        timeout_b: request.timeout_b,
        initiator_pubkey: String::new(),
        participant_pubkey: request.counterparty,
        initiator_redeem_key: request.redeem_key.unwrap_or_default(),
        initiator_refund_key: request.refund_key.unwrap_or_default(),
        participant_redeem_key: String::new(),
        participant_refund_key: String::new(),
    };

    match state.manager.initiate_swap(params).await {
        Ok(swap_id) => (
            StatusCode::CREATED,
            Json(SwapCreatedResponse {
                status: "ok".into(),
                swap_id: Some(swap_id.0),
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(SwapCreatedResponse {
                status: "failed".into(),
                swap_id: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

/// List all swaps held by the manager
async fn list_swaps(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.list_swaps().await)
}

/// Full status of one swap
async fn get_swap(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.manager.status(SwapId(id)).await {
        Some(status) => (StatusCode::OK, Json(Some(status))),
        None => (StatusCode::NOT_FOUND, Json(None)),
    }
}

/// Abort a swap; only legal before funding
async fn cancel_swap(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.manager.cancel_swap(SwapId(id)).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::NOT_FOUND,
    }
}

/// Aggregate counts by state
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    let mut stats = StatsResponse::default();
    for status in state.manager.list_swaps().await {
        match status.state.as_str() {
            "completed" => stats.completed += 1,
            "refunded" => stats.refunded += 1,
            "failed" => stats.failed += 1,
            "expired" => stats.expired += 1,
            _ => stats.active += 1,
        }
    }
    Json(stats)
}

// Request/response types

#[derive(Deserialize)]
struct SwapRequest {
    chain_a: u64,
    amount_a: u64,
    timeout_a: u64,
    chain_b: u64,
    amount_b: u64,
    timeout_b: u64,
    /// Counterparty negotiation public key (hex)
    counterparty: String,
    redeem_key: Option<String>,
    refund_key: Option<String>,
}

#[derive(Serialize)]
struct SwapCreatedResponse {
    status: String,
    swap_id: Option<Uuid>,
    error: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    storage: bool,
    chains: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize, Default)]
struct StatsResponse {
    active: u64,
    completed: u64,
    refunded: u64,
    failed: u64,
    expired: u64,
}
