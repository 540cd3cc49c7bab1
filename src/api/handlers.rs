//! Request Handlers

use super::{errors::ApiError, middleware::RequestId, models::*};
use crate::{
    common::traits::{Ledger, RoundStore},
    errors::LedgerError,
    games::{
        engine::{EngineHandle, RoundSnapshot},
        types::{WagerReceipt, WagerRequest, MAX_PLAYER_ID_LEN},
    },
};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;

const MAX_PAGE: usize = 100;
const PROFILE_WAGERS: usize = 50;

fn check_player_id(request_id: &RequestId, player_id: &str) -> Result<(), ApiError> {
    if player_id.trim().is_empty() {
        return Err(ApiError::bad_request(
            request_id.0.clone(),
            "player_id must not be empty".to_string(),
        ));
    }
    if player_id.len() > MAX_PLAYER_ID_LEN {
        return Err(ApiError::bad_request(
            request_id.0.clone(),
            format!("player_id longer than {} bytes", MAX_PLAYER_ID_LEN),
        ));
    }
    Ok(())
}

fn ledger_error(request_id: String, player_id: &str, err: LedgerError) -> ApiError {
    match err {
        LedgerError::UnknownAccount(_) => {
            ApiError::not_found(request_id, format!("Player {} not found", player_id))
        }
        e if e.is_transient() => ApiError::service_unavailable(request_id, e.to_string()),
        e => ApiError::internal_error(request_id, e.to_string()),
    }
}

/// Shared application state
pub struct AppState {
    pub engine: EngineHandle,
    pub store: Arc<dyn RoundStore>,
    pub ledger: Arc<dyn Ledger>,
    pub version: String,
}

impl AppState {
    pub fn new(engine: EngineHandle, store: Arc<dyn RoundStore>, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            engine,
            store,
            ledger,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let engine_running = state.engine.is_running();
    Json(HealthResponse {
        status: if engine_running { "Running" } else { "Stopped" }.to_string(),
        version: state.version.clone(),
        engine_running,
    })
}

/// GET /api/round
pub async fn current_round_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RoundSnapshot>, ApiError> {
    state
        .engine
        .snapshot()
        .await
        .map(Json)
        .map_err(|e| ApiError::service_unavailable(request_id.0, e.to_string()))
}

/// POST /api/bets
pub async fn place_bet_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Json(request): Json<WagerRequest>,
) -> Result<(StatusCode, Json<WagerReceipt>), ApiError> {
    check_player_id(&request_id, &request.player_id)?;

    let receipt = state
        .engine
        .admit_wager(request)
        .await
        .map_err(|e| ApiError::from_admit(request_id.0, e))?;

    Ok((StatusCode::CREATED, Json(receipt)))
}

#[derive(Debug, Deserialize)]
pub struct RoundsQuery {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default = "default_rounds_limit")]
    pub limit: usize,
}

fn default_rounds_limit() -> usize {
    20
}

/// GET /api/rounds?cursor={cursor}&limit={n}
pub async fn rounds_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Query(params): Query<RoundsQuery>,
) -> Result<Json<RoundsResponse>, ApiError> {
    if params.limit == 0 {
        return Err(ApiError::bad_request(
            request_id.0,
            "limit must be positive".to_string(),
        ));
    }
    let limit = params.limit.min(MAX_PAGE);

    let (rounds, next_cursor) = state
        .store
        .recent_rounds(params.cursor.as_deref(), limit)
        .await
        .map_err(|e| ApiError::from_internal(request_id.0, e))?;

    Ok(Json(RoundsResponse {
        rounds: rounds.iter().map(RoundSummary::from).collect(),
        next_cursor,
    }))
}

/// GET /api/rounds/:round_id
pub async fn round_detail_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(round_id): Path<u64>,
) -> Result<Json<RoundDetailResponse>, ApiError> {
    let round = state
        .store
        .load_round(round_id)
        .await
        .map_err(|e| ApiError::internal_error(request_id.0.clone(), e.to_string()))?
        .ok_or_else(|| {
            ApiError::not_found(request_id.0.clone(), format!("Round {} not found", round_id))
        })?;

    let wagers = state
        .store
        .load_round_wagers(round_id)
        .await
        .map_err(|e| ApiError::internal_error(request_id.0, e.to_string()))?;

    Ok(Json(RoundDetailResponse { round, wagers }))
}

/// GET /api/players/:player_id/balance
pub async fn balance_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(player_id): Path<String>,
) -> Result<Json<BalanceResponse>, ApiError> {
    check_player_id(&request_id, &player_id)?;
    let balance = state
        .ledger
        .balance(&player_id)
        .await
        .map_err(|e| ledger_error(request_id.0, &player_id, e))?;
    Ok(Json(BalanceResponse { player_id, balance }))
}

/// GET /api/players/:player_id
pub async fn player_profile_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(player_id): Path<String>,
) -> Result<Json<PlayerProfileResponse>, ApiError> {
    check_player_id(&request_id, &player_id)?;
    let balance = state
        .ledger
        .balance(&player_id)
        .await
        .map_err(|e| ledger_error(request_id.0.clone(), &player_id, e))?;
    let stats = state
        .store
        .player_stats(&player_id)
        .await
        .map_err(|e| ApiError::from_internal(request_id.0.clone(), e))?;
    let recent_wagers = state
        .store
        .player_wagers(&player_id, PROFILE_WAGERS)
        .await
        .map_err(|e| ApiError::from_internal(request_id.0, e))?;

    Ok(Json(PlayerProfileResponse {
        player_id,
        balance,
        stats,
        recent_wagers,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PlayerWagersQuery {
    #[serde(default = "default_wagers_limit")]
    pub limit: usize,
}

fn default_wagers_limit() -> usize {
    50
}

/// GET /api/players/:player_id/wagers?limit={n}
pub async fn player_wagers_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(player_id): Path<String>,
    Query(params): Query<PlayerWagersQuery>,
) -> Result<Json<PlayerWagersResponse>, ApiError> {
    check_player_id(&request_id, &player_id)?;
    let wagers = state
        .store
        .player_wagers(&player_id, params.limit.clamp(1, MAX_PAGE))
        .await
        .map_err(|e| ApiError::from_internal(request_id.0, e))?;

    Ok(Json(PlayerWagersResponse { player_id, wagers }))
}

/// GET /metrics (Prometheus text format)
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.engine.metrics().render(),
    )
}
