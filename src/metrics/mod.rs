//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and RPC escalations
//! - Swap lifecycle (created, transitions, terminal outcomes)
//! - On-chain broadcasts per kind
//! - Protocol messages and anomalies

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Encoder, Gauge,
    GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

use crate::error::SwapResult;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "asnd_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref RPC_ESCALATIONS: CounterVec = register_counter_vec!(
        "asnd_rpc_escalations_total",
        "RPC failures escalated after exhausting the retry budget",
        &["chain_id"]
    ).unwrap();

    pub static ref REORGS: CounterVec = register_counter_vec!(
        "asnd_reorgs_total",
        "Reorganizations that unwound a watched transaction",
        &["chain_id"]
    ).unwrap();

    // Swap metrics
    pub static ref ACTIVE_SWAPS: Gauge = register_gauge!(
        "asnd_active_swaps",
        "Sessions currently held by the manager"
    ).unwrap();

    pub static ref SWAPS_CREATED: CounterVec = register_counter_vec!(
        "asnd_swaps_created_total",
        "Sessions created by role",
        &["role"]
    ).unwrap();

    pub static ref STATE_TRANSITIONS: CounterVec = register_counter_vec!(
        "asnd_state_transitions_total",
        "State machine transitions by target state",
        &["state"]
    ).unwrap();

    pub static ref SWAPS_TERMINAL: CounterVec = register_counter_vec!(
        "asnd_swaps_terminal_total",
        "Swaps reaching a terminal state, by outcome",
        &["state"]
    ).unwrap();

    pub static ref BROADCASTS: CounterVec = register_counter_vec!(
        "asnd_broadcasts_total",
        "On-chain broadcasts by kind",
        &["chain_id", "kind"]
    ).unwrap();

    // Protocol metrics
    pub static ref MESSAGES_RECEIVED: CounterVec = register_counter_vec!(
        "asnd_messages_received_total",
        "Protocol messages received by kind",
        &["kind"]
    ).unwrap();

    pub static ref ANOMALIES: CounterVec = register_counter_vec!(
        "asnd_protocol_anomalies_total",
        "Discarded events with no valid transition",
        &["kind"]
    ).unwrap();

    pub static ref ALERTS: CounterVec = register_counter_vec!(
        "asnd_operator_alerts_total",
        "Alerts surfaced to the operator",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECKS: CounterVec = register_counter_vec!(
        "asnd_health_checks_total",
        "Completed health check rounds",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> SwapResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::error::SwapError::Internal(e.to_string()))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::SwapError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_rpc_escalation(chain_id: u64) {
    RPC_ESCALATIONS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_reorg(chain_id: u64) {
    REORGS.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_active_swaps(count: i64) {
    ACTIVE_SWAPS.set(count as f64);
}

pub fn record_swap_created(role: &str) {
    SWAPS_CREATED.with_label_values(&[role]).inc();
}

pub fn record_transition(state: &str) {
    STATE_TRANSITIONS.with_label_values(&[state]).inc();
}

pub fn record_swap_terminal(state: &str) {
    SWAPS_TERMINAL.with_label_values(&[state]).inc();
}

pub fn record_broadcast(chain_id: u64, kind: &str) {
    BROADCASTS
        .with_label_values(&[&chain_id.to_string(), kind])
        .inc();
}

pub fn record_message(kind: &str) {
    MESSAGES_RECEIVED.with_label_values(&[kind]).inc();
}

pub fn record_anomaly(kind: &str) {
    ANOMALIES.with_label_values(&[kind]).inc();
}

pub fn record_alert() {
    ALERTS.with_label_values(&[]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECKS.with_label_values(&[]).inc();
}
