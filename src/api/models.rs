//! API Response Models

use crate::games::types::{PlayerStats, Round, RoundPhase, Wager};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub engine_running: bool,
}

/// Paginated round history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundsResponse {
    pub rounds: Vec<RoundSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round_id: u64,
    pub phase: RoundPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector: Option<u8>,
    pub wager_count: u64,
    pub total_wagered: u64,
    pub total_paid: u64,
    pub opened_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at_ms: Option<i64>,
}

impl From<&Round> for RoundSummary {
    fn from(round: &Round) -> Self {
        let totals = round.aggregates.clone().unwrap_or_default();
        Self {
            round_id: round.round_id,
            phase: round.phase,
            outcome: round.outcome.as_ref().map(|o| o.kind.as_str().to_string()),
            sector: round.outcome.as_ref().map(|o| o.sector),
            wager_count: totals.wager_count,
            total_wagered: totals.total_wagered,
            total_paid: totals.total_paid,
            opened_at_ms: round.opened_at_ms,
            closed_at_ms: round.closed_at_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundDetailResponse {
    pub round: Round,
    pub wagers: Vec<Wager>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub player_id: String,
    pub balance: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerWagersResponse {
    pub player_id: String,
    pub wagers: Vec<Wager>,
}

/// Balance, lifetime totals and recent wagers of one player
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerProfileResponse {
    pub player_id: String,
    pub balance: u64,
    pub stats: PlayerStats,
    pub recent_wagers: Vec<Wager>,
}
