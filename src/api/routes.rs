//! Route Definitions

use super::{
    handlers::*,
    middleware::require_api_key,
    websocket::{crash_websocket_handler, user_websocket_handler},
};
use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Build the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    // Operator and payment provider endpoints
    let protected = Router::new()
        .route("/api/payments/notify", post(payment_notify_handler))
        .route("/admin/abort", post(abort_handler))
        .route("/admin/resume", post(resume_handler))
        .route("/admin/game-stats", get(game_stats_handler))
        .route_layer(from_fn_with_state(state.clone(), require_api_key));

    let mut public = Router::new()
        .route("/health", get(health_handler))
        .route("/api/crash/state", get(state_handler))
        .route("/api/crash/history", get(history_handler))
        .route("/api/crash/rounds/:id", get(round_detail_handler))
        .route("/api/crash/players/:id/bets", get(player_bets_handler))
        .route("/api/ws/crash", get(crash_websocket_handler))
        .route("/api/ws/user/:user_id", get(user_websocket_handler));
    if state.metrics_enabled {
        public = public.route("/metrics", get(metrics_handler));
    }

    public.merge(protected).with_state(state)
}
