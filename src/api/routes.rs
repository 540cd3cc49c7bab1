//! Route Definitions

use super::{handlers::*, websocket::websocket_handler};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        // Live round
        .route("/api/round", get(current_round_handler))
        .route("/api/bets", post(place_bet_handler))
        // Settled history
        .route("/api/rounds", get(rounds_handler))
        .route("/api/rounds/:round_id", get(round_detail_handler))
        // Players
        .route("/api/players/:player_id", get(player_profile_handler))
        .route("/api/players/:player_id/balance", get(balance_handler))
        .route("/api/players/:player_id/wagers", get(player_wagers_handler))
        .route("/ws", get(websocket_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
