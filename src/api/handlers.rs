//! Request Handlers

use super::{errors::ApiError, middleware::RequestId};
use crate::game_store::{GameStore, HouseStats};
use crate::games::{
    verify_crash_point, CrashCurve, FairnessProof, PlayerId, RoundId, RoundRecord,
    RoundStateMachine, RoundView, WagerRecord,
};
use crate::hub::{BroadcastHub, InboundRouter};
use crate::metrics::MetricsRegistry;
use crate::payments::{PaymentNotification, PaymentOutcome, PaymentProcessor};
use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_HISTORY_LIMIT: usize = 20;
pub const MAX_HISTORY_LIMIT: usize = 100;

/// Shared application state
pub struct AppState {
    pub machine: Arc<RoundStateMachine>,
    pub hub: Arc<BroadcastHub>,
    pub router: Arc<InboundRouter>,
    pub store: Arc<dyn GameStore>,
    pub payments: Arc<PaymentProcessor>,
    pub metrics: Arc<MetricsRegistry>,
    pub curve: CrashCurve,
    pub admin_api_key: Option<String>,
    pub metrics_enabled: bool,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub halted: bool,
    pub connections: usize,
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let halted = state.machine.is_halted();
    Json(HealthResponse {
        status: if halted { "Halted" } else { "Running" }.to_string(),
        version: state.version.clone(),
        halted,
        connections: state.hub.connection_count(),
    })
}

/// GET /api/crash/state
pub async fn state_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RoundView>, ApiError> {
    state
        .machine
        .current_round()
        .map(Json)
        .ok_or_else(|| ApiError::service_unavailable(request_id.0, "No round in progress"))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn clamped(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub rounds: Vec<RoundRecord>,
}

/// GET /api/crash/history?limit={n}
pub async fn history_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let rounds = state
        .store
        .recent_rounds(query.clamped())
        .await
        .map_err(|e| ApiError::from_store(request_id.0, e))?;
    Ok(Json(HistoryResponse { rounds }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoundDetailResponse {
    pub round: RoundRecord,
    pub wagers: Vec<WagerRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fairness: Option<FairnessProof>,
    /// Crash point recomputed from the proof, when the proof verifies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_crash_point: Option<f64>,
}

/// GET /api/crash/rounds/:id
pub async fn round_detail_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(round_id): Path<u64>,
) -> Result<Json<RoundDetailResponse>, ApiError> {
    let round_id = RoundId(round_id);
    let round = state
        .store
        .load_round(round_id)
        .await
        .map_err(|e| ApiError::from_store(request_id.0.clone(), e))?
        .ok_or_else(|| {
            ApiError::not_found(request_id.0.clone(), format!("Round {} not found", round_id))
        })?;
    let wagers = state
        .store
        .round_wagers(round_id)
        .await
        .map_err(|e| ApiError::from_store(request_id.0.clone(), e))?;

    let verified_crash_point = match &round.fairness {
        Some(proof) => match verify_crash_point(proof, round_id, &state.curve) {
            Ok(point) => point,
            Err(e) => {
                warn!(round_id = %round_id, error = %e, "Stored fairness proof is malformed");
                None
            }
        },
        None => None,
    };

    Ok(Json(RoundDetailResponse {
        fairness: round.fairness.clone(),
        round,
        wagers,
        verified_crash_point,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlayerBetsResponse {
    pub user_id: PlayerId,
    pub bets: Vec<WagerRecord>,
}

/// GET /api/crash/players/:id/bets?limit={n}
pub async fn player_bets_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(player): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<PlayerBetsResponse>, ApiError> {
    let player = PlayerId(player);
    let bets = state
        .store
        .player_wagers(player, query.clamped())
        .await
        .map_err(|e| ApiError::from_store(request_id.0, e))?;
    Ok(Json(PlayerBetsResponse {
        user_id: player,
        bets,
    }))
}

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub status: PaymentOutcome,
}

/// POST /api/payments/notify
pub async fn payment_notify_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(notification): Json<PaymentNotification>,
) -> Result<Json<PaymentResponse>, ApiError> {
    let status = state
        .payments
        .handle_notification(&notification)
        .await
        .map_err(|e| ApiError::from_payment(request_id.0, e))?;

    match status {
        PaymentOutcome::Credited => MetricsRegistry::incr(&state.metrics.payments_credited),
        PaymentOutcome::Duplicate => MetricsRegistry::incr(&state.metrics.payments_duplicate),
    }
    Ok(Json(PaymentResponse { status }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AbortResponse {
    pub status: String,
    pub round_id: RoundId,
}

/// POST /admin/abort
pub async fn abort_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<AbortResponse>, ApiError> {
    let round_id = state
        .machine
        .abort()
        .map_err(|e| ApiError::from_bet(request_id.0, e))?;
    info!(round_id = %round_id, "Abort accepted");
    Ok(Json(AbortResponse {
        status: "aborting".to_string(),
        round_id,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResumeResponse {
    pub status: String,
    pub round_id: RoundId,
    pub credits_issued: usize,
}

/// POST /admin/resume
pub async fn resume_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<ResumeResponse>, ApiError> {
    let report = state
        .machine
        .resume()
        .await
        .map_err(|e| ApiError::from_settlement(request_id.0, e))?;
    Ok(Json(ResumeResponse {
        status: "resumed".to_string(),
        round_id: report.round.round_id,
        credits_issued: report.credits_issued,
    }))
}

/// GET /admin/game-stats
pub async fn game_stats_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<HouseStats>, ApiError> {
    state
        .store
        .house_stats()
        .await
        .map(Json)
        .map_err(|e| ApiError::from_store(request_id.0, e))
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus_format(),
    )
}
