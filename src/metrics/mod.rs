//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Transaction outcomes and latency
//! - Participant calls and health
//! - Version conflicts and protocol violations
//! - Recovery activity

use crate::coordination::{ParticipantId, TransactionState, Vote};
use crate::error::{CoordinatorError, CoordinatorResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Transaction metrics
    pub static ref TX_BEGUN: CounterVec = register_counter_vec!(
        "coordinator_transactions_begun_total",
        "Total transactions begun",
        &[]
    ).unwrap();

    pub static ref TX_OUTCOMES: CounterVec = register_counter_vec!(
        "coordinator_transaction_outcomes_total",
        "Total transactions reaching a terminal state",
        &["state"]
    ).unwrap();

    pub static ref TX_RUN_LATENCY: HistogramVec = register_histogram_vec!(
        "coordinator_run_latency_seconds",
        "Time from run to terminal state",
        &["state"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    // Participant metrics
    pub static ref PARTICIPANT_CALLS: CounterVec = register_counter_vec!(
        "coordinator_participant_calls_total",
        "Participant calls by operation and result",
        &["participant", "operation", "result"]
    ).unwrap();

    pub static ref PARTICIPANT_HEALTHY: GaugeVec = register_gauge_vec!(
        "coordinator_participant_healthy",
        "Participant reachability (1=healthy, 0=unreachable)",
        &["participant"]
    ).unwrap();

    pub static ref VOTES: CounterVec = register_counter_vec!(
        "coordinator_votes_total",
        "Votes folded into transactions",
        &["vote"]
    ).unwrap();

    // Protocol metrics
    pub static ref VERSION_CONFLICTS: CounterVec = register_counter_vec!(
        "coordinator_version_conflicts_total",
        "Optimistic version conflicts on the transaction log",
        &[]
    ).unwrap();

    pub static ref PROTOCOL_VIOLATIONS: CounterVec = register_counter_vec!(
        "coordinator_protocol_violations_total",
        "Contradicting or foreign votes",
        &[]
    ).unwrap();

    // Recovery metrics
    pub static ref RECOVERED: CounterVec = register_counter_vec!(
        "coordinator_recovered_transactions_total",
        "Transactions handled by recovery passes",
        &["result"]
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

    pub async fn run(&self) -> CoordinatorResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| CoordinatorError::Internal(format!("bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| CoordinatorError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer).map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_transaction_begun() {
    TX_BEGUN.with_label_values(&[]).inc();
}

pub fn record_outcome(state: TransactionState) {
    TX_OUTCOMES.with_label_values(&[state.as_str()]).inc();
}

pub fn record_run_latency(state: TransactionState, latency_secs: f64) {
    TX_RUN_LATENCY
        .with_label_values(&[state.as_str()])
        .observe(latency_secs);
}

pub fn record_participant_call(participant: &ParticipantId, operation: &str, result: &str) {
    PARTICIPANT_CALLS
        .with_label_values(&[participant.as_str(), operation, result])
        .inc();
}

pub fn record_participant_health(participant: &ParticipantId, healthy: bool) {
    PARTICIPANT_HEALTHY
        .with_label_values(&[participant.as_str()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_vote(vote: Vote) {
    let label = match vote {
        Vote::Yes => "yes",
        Vote::No => "no",
        Vote::Unknown => "unknown",
    };
    VOTES.with_label_values(&[label]).inc();
}

pub fn record_conflict() {
    VERSION_CONFLICTS.with_label_values(&[]).inc();
}

pub fn record_protocol_violation() {
    PROTOCOL_VIOLATIONS.with_label_values(&[]).inc();
}

pub fn record_recovery(result: &str) {
    RECOVERED.with_label_values(&[result]).inc();
}
