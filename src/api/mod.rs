//! HTTP API for running transactions, health checks and statistics

use crate::config::ApiConfig;
use crate::coordination::{
    Outcome, ParticipantId, TransactionId, TransactionState, Vote, VoteReceipt, VoteRecord,
};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::orchestrator::Orchestrator;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            started_at: Instant::now(),
        }
    }
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/transactions", post(create_transaction))
        .route("/transactions/:id", get(get_transaction))
        .route("/transactions/:id/run", post(run_transaction))
        .route("/transactions/:id/votes", get(list_votes).post(report_vote))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> CoordinatorResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CoordinatorError::Internal(format!("bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| CoordinatorError::Internal(e.to_string()))?;

    Ok(())
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoordinatorError::InvalidArgument(_) | CoordinatorError::UnknownParticipant { .. } => {
                StatusCode::BAD_REQUEST
            }
            CoordinatorError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoordinatorError::Conflict { .. } | CoordinatorError::ProtocolViolation { .. } => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check endpoint - basic liveness
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        instance_id: state.orchestrator.coordinator().config().instance_id.clone(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// Readiness check - verify the log and every participant
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let coordinator = state.orchestrator.coordinator();

    let log_ok = coordinator.log().health_check().await.is_ok();
    let participant_health = coordinator.registry().health_check().await;
    let participants_ok = participant_health.iter().all(|(_, healthy)| *healthy);

    let status = if log_ok && participants_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: log_ok && participants_ok,
            log: log_ok,
            participants: participant_health
                .into_iter()
                .map(|(participant, healthy)| ParticipantHealth {
                    participant,
                    healthy,
                })
                .collect(),
        }),
    )
}

/// Transaction count per state
async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, CoordinatorError> {
    let coordinator = state.orchestrator.coordinator();
    let transactions = coordinator.log().stats().await?;

    Ok(Json(StatsResponse {
        transactions,
        participants: coordinator.registry().ids(),
    }))
}

async fn create_transaction(
    State(state): State<AppState>,
    Json(request): Json<CreateTransactionRequest>,
) -> Result<(StatusCode, Json<CreatedResponse>), CoordinatorError> {
    let participants = request
        .participants
        .into_iter()
        .map(|p| (p.id, p.payload))
        .collect();

    let id = state
        .orchestrator
        .begin_with_payloads(&request.label, participants)
        .await?;

    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Outcome>, CoordinatorError> {
    let id: TransactionId = id.parse()?;
    Ok(Json(state.orchestrator.outcome(&id).await?))
}

/// Run to a terminal state; answers `202` with the current state if the
/// wait runs out first
async fn run_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Option<Json<RunRequest>>,
) -> Result<(StatusCode, Json<Outcome>), CoordinatorError> {
    let id: TransactionId = id.parse()?;
    let timeout = request
        .and_then(|Json(r)| r.timeout_ms)
        .map(Duration::from_millis);

    match state.orchestrator.run(id, timeout).await {
        Ok(outcome) => Ok((StatusCode::OK, Json(outcome))),
        Err(CoordinatorError::Timeout { .. }) => {
            let outcome = state.orchestrator.outcome(&id).await?;
            Ok((StatusCode::ACCEPTED, Json(outcome)))
        }
        Err(e) => Err(e),
    }
}

/// Votes received while the transaction is in flight, in arrival order
async fn list_votes(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<VoteRecord>>, CoordinatorError> {
    let id: TransactionId = id.parse()?;
    Ok(Json(state.orchestrator.votes(&id).await?))
}

async fn report_vote(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<VoteRequest>,
) -> Result<Json<VoteResponse>, CoordinatorError> {
    let id: TransactionId = id.parse()?;
    let receipt = state
        .orchestrator
        .report_vote(id, request.participant, request.vote)
        .await?;

    Ok(Json(VoteResponse { receipt }))
}

// Request types

#[derive(Deserialize)]
struct CreateTransactionRequest {
    label: String,
    participants: Vec<ParticipantRequest>,
}

#[derive(Deserialize)]
struct ParticipantRequest {
    id: ParticipantId,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct RunRequest {
    timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
struct VoteRequest {
    participant: ParticipantId,
    vote: Vote,
}

// Response types

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    instance_id: String,
    uptime_seconds: u64,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    log: bool,
    participants: Vec<ParticipantHealth>,
}

#[derive(Serialize)]
struct ParticipantHealth {
    participant: ParticipantId,
    healthy: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    transactions: BTreeMap<TransactionState, u64>,
    participants: Vec<ParticipantId>,
}

#[derive(Serialize)]
struct CreatedResponse {
    id: TransactionId,
}

#[derive(Serialize)]
struct VoteResponse {
    receipt: VoteReceipt,
}
