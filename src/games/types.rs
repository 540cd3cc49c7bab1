//! Round and wager records
//!
//! These are the persisted shapes (bincode in RocksDB, JSON over the API), so
//! field changes must stay backward compatible with stored data.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Longest accepted player id in bytes
pub const MAX_PLAYER_ID_LEN: usize = 128;

/// Category a wager targets, e.g. `red`. Always lowercase.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BetKind(String);

impl BetKind {
    /// Normalize user input; whether the kind exists is checked against the sector table
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            None
        } else {
            Some(Self(normalized))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Round phase. `Settled` and `Voided` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundPhase {
    Betting,
    Drawing,
    /// Settlement journaled but not yet confirmed; a restart finishes it
    Settling,
    Settled,
    /// Abandoned by a restart; every pending wager was refunded
    Voided,
}

impl RoundPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundPhase::Settled | RoundPhase::Voided)
    }
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoundPhase::Betting => "BETTING",
            RoundPhase::Drawing => "DRAWING",
            RoundPhase::Settling => "SETTLING",
            RoundPhase::Settled => "SETTLED",
            RoundPhase::Voided => "VOIDED",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WagerStatus {
    Pending,
    Won,
    Lost,
    Refunded,
}

/// The drawn sector
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub sector: u8,
    pub kind: BetKind,
}

/// Totals written with the settled round record
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundAggregates {
    pub wager_count: u64,
    pub total_wagered: u64,
    pub total_paid: u64,
    pub winners: u64,
    pub wagered_by_kind: BTreeMap<BetKind, u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub round_id: u64,
    pub phase: RoundPhase,
    /// Unix millis at which the current phase ends
    pub phase_deadline_ms: i64,
    pub outcome: Option<Outcome>,
    pub opened_at_ms: i64,
    pub closed_at_ms: Option<i64>,
    pub aggregates: Option<RoundAggregates>,
}

impl Round {
    pub fn open(round_id: u64, now_ms: i64, deadline_ms: i64) -> Self {
        Self {
            round_id,
            phase: RoundPhase::Betting,
            phase_deadline_ms: deadline_ms,
            outcome: None,
            opened_at_ms: now_ms,
            closed_at_ms: None,
            aggregates: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wager {
    pub wager_id: String,
    pub round_id: u64,
    pub player_id: String,
    pub bet_kind: BetKind,
    pub amount: u64,
    pub status: WagerStatus,
    pub payout: u64,
    pub placed_at_ms: i64,
}

impl Wager {
    pub fn is_pending(&self) -> bool {
        self.status == WagerStatus::Pending
    }

    /// Ledger reference of this wager's payout
    pub fn payout_reference(&self) -> String {
        format!("payout:{}", self.wager_id)
    }

    /// Ledger reference of this wager's refund
    pub fn refund_reference(&self) -> String {
        format!("refund:{}", self.wager_id)
    }
}

/// Lifetime totals of one player. Refunded wagers are left out.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub total_bets: u64,
    pub total_wagered: u64,
    pub total_won: u64,
    pub net_profit: i64,
}

impl PlayerStats {
    pub fn from_wagers(wagers: &[Wager]) -> Self {
        let mut stats = Self::default();
        for wager in wagers.iter().filter(|w| w.status != WagerStatus::Refunded) {
            stats.total_bets += 1;
            stats.total_wagered = stats.total_wagered.saturating_add(wager.amount);
            stats.total_won = stats.total_won.saturating_add(wager.payout);
        }
        let net = stats.total_won as i128 - stats.total_wagered as i128;
        stats.net_profit = net.clamp(i64::MIN as i128, i64::MAX as i128) as i64;
        stats
    }
}

/// Inbound wager request as received from the transport layer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WagerRequest {
    pub player_id: String,
    pub bet_kind: String,
    pub amount: u64,
}

impl WagerRequest {
    pub fn new(player_id: impl Into<String>, bet_kind: impl Into<String>, amount: u64) -> Self {
        Self {
            player_id: player_id.into(),
            bet_kind: bet_kind.into(),
            amount,
        }
    }
}

/// Returned to the caller on successful admission
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WagerReceipt {
    pub wager_id: String,
    pub round_id: u64,
    pub bet_kind: BetKind,
    pub amount: u64,
    /// Player balance after the debit
    pub balance: u64,
}

/// One entry of the recent outcome strip
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub round_id: u64,
    pub outcome: Outcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bet_kind_normalization() {
        assert_eq!(BetKind::parse(" Red ").unwrap().as_str(), "red");
        assert!(BetKind::parse("   ").is_none());
    }

    #[test]
    fn test_phase_serialization() {
        assert_eq!(serde_json::to_string(&RoundPhase::Betting).unwrap(), "\"BETTING\"");
        assert_eq!(RoundPhase::Drawing.to_string(), "DRAWING");
        assert!(RoundPhase::Voided.is_terminal());
        assert!(!RoundPhase::Drawing.is_terminal());
        assert!(!RoundPhase::Settling.is_terminal());
        assert_eq!(serde_json::to_string(&RoundPhase::Settling).unwrap(), "\"SETTLING\"");
    }

    #[test]
    fn test_player_stats_skip_refunds() {
        let wager = |status, amount, payout| Wager {
            wager_id: format!("w-{}", amount),
            round_id: 1,
            player_id: "alice".to_string(),
            bet_kind: BetKind::parse("red").unwrap(),
            amount,
            status,
            payout,
            placed_at_ms: 0,
        };
        let stats = PlayerStats::from_wagers(&[
            wager(WagerStatus::Won, 30, 60),
            wager(WagerStatus::Lost, 50, 0),
            wager(WagerStatus::Refunded, 70, 0),
            wager(WagerStatus::Pending, 5, 0),
        ]);
        assert_eq!(stats.total_bets, 3);
        assert_eq!(stats.total_wagered, 85);
        assert_eq!(stats.total_won, 60);
        assert_eq!(stats.net_profit, -25);
    }

    #[test]
    fn test_round_bincode_roundtrip() {
        let mut round = Round::open(7, 1_000, 26_000);
        round.outcome = Some(Outcome {
            sector: 0,
            kind: BetKind::parse("green").unwrap(),
        });
        let mut aggregates = RoundAggregates::default();
        aggregates.wagered_by_kind.insert(BetKind::parse("green").unwrap(), 40);
        round.aggregates = Some(aggregates);

        let bytes = bincode::serialize(&round).unwrap();
        let decoded: Round = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, round);
    }
}
