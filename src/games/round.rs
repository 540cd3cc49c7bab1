//! In-memory state of the active round
//!
//! Owned exclusively by the engine task. Wagers are kept in admission order
//! with a per-player count so the cap check is O(1).

use crate::errors::InvariantViolation;
use crate::games::types::{
    BetKind, Outcome, Round, RoundAggregates, RoundPhase, Wager, WagerStatus,
};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug)]
pub struct ActiveRound {
    round: Round,
    wagers: Vec<Wager>,
    per_player: HashMap<String, usize>,
    totals_by_kind: BTreeMap<BetKind, u64>,
    /// Compensated admissions as REFUNDED records
    withdrawn: Vec<Wager>,
    /// Whether the opening record reached the store
    journaled: bool,
}

impl ActiveRound {
    pub fn open(round_id: u64, now_ms: i64, deadline_ms: i64) -> Self {
        Self {
            round: Round::open(round_id, now_ms, deadline_ms),
            wagers: Vec::new(),
            per_player: HashMap::new(),
            totals_by_kind: BTreeMap::new(),
            withdrawn: Vec::new(),
            journaled: false,
        }
    }

    pub fn round(&self) -> &Round {
        &self.round
    }

    pub fn round_id(&self) -> u64 {
        self.round.round_id
    }

    pub fn phase(&self) -> RoundPhase {
        self.round.phase
    }

    pub fn deadline_ms(&self) -> i64 {
        self.round.phase_deadline_ms
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.round.outcome.as_ref()
    }

    pub fn wagers(&self) -> &[Wager] {
        &self.wagers
    }

    pub fn withdrawn(&self) -> &[Wager] {
        &self.withdrawn
    }

    pub fn totals_by_kind(&self) -> &BTreeMap<BetKind, u64> {
        &self.totals_by_kind
    }

    pub fn wager_count(&self, player_id: &str) -> usize {
        self.per_player.get(player_id).copied().unwrap_or(0)
    }

    /// Admission is open: BETTING and the deadline not yet reached
    pub fn accepts_wagers(&self, now_ms: i64) -> bool {
        self.round.phase == RoundPhase::Betting && now_ms < self.round.phase_deadline_ms
    }

    pub fn is_journaled(&self) -> bool {
        self.journaled
    }

    pub fn mark_journaled(&mut self) {
        self.journaled = true;
    }

    pub fn insert(&mut self, wager: Wager) -> Result<(), InvariantViolation> {
        if wager.round_id != self.round.round_id {
            return Err(InvariantViolation::ForeignWager {
                wager_id: wager.wager_id,
                wager_round: wager.round_id,
                round_id: self.round.round_id,
            });
        }
        if self.round.phase != RoundPhase::Betting {
            return Err(self.illegal(RoundPhase::Betting));
        }
        *self.per_player.entry(wager.player_id.clone()).or_default() += 1;
        *self.totals_by_kind.entry(wager.bet_kind.clone()).or_default() += wager.amount;
        self.wagers.push(wager);
        Ok(())
    }

    /// Undo an insert whose journal write failed
    pub fn remove(&mut self, wager_id: &str) -> Option<Wager> {
        let idx = self.wagers.iter().position(|w| w.wager_id == wager_id)?;
        let wager = self.wagers.remove(idx);
        if let Some(count) = self.per_player.get_mut(&wager.player_id) {
            *count -= 1;
            if *count == 0 {
                self.per_player.remove(&wager.player_id);
            }
        }
        if let Some(total) = self.totals_by_kind.get_mut(&wager.bet_kind) {
            *total -= wager.amount;
            if *total == 0 {
                self.totals_by_kind.remove(&wager.bet_kind);
            }
        }
        Some(wager)
    }

    /// Remove a compensated wager and keep it as REFUNDED for the settlement batch
    pub fn withdraw(&mut self, wager_id: &str) -> Option<Wager> {
        let mut wager = self.remove(wager_id)?;
        wager.status = WagerStatus::Refunded;
        wager.payout = 0;
        self.withdrawn.push(wager.clone());
        Some(wager)
    }

    /// BETTING -> DRAWING; fixes the outcome. Betting counts as closed from
    /// its deadline even when the transition runs later.
    pub fn begin_drawing(
        &mut self,
        outcome: Outcome,
        now_ms: i64,
        deadline_ms: i64,
    ) -> Result<(), InvariantViolation> {
        if self.round.outcome.is_some() {
            return Err(InvariantViolation::OutcomeAlreadyDrawn {
                round_id: self.round.round_id,
            });
        }
        if self.round.phase != RoundPhase::Betting {
            return Err(self.illegal(RoundPhase::Drawing));
        }
        self.round.phase = RoundPhase::Drawing;
        self.round.outcome = Some(outcome);
        self.round.closed_at_ms = Some(now_ms.min(self.round.phase_deadline_ms));
        self.round.phase_deadline_ms = deadline_ms;
        Ok(())
    }

    /// DRAWING -> SETTLED with the finalized wagers
    pub fn complete(
        &mut self,
        settled_round: Round,
        settled_wagers: Vec<Wager>,
        deadline_ms: i64,
    ) -> Result<(), InvariantViolation> {
        if self.round.phase != RoundPhase::Drawing {
            return Err(self.illegal(RoundPhase::Settled));
        }
        if settled_round.round_id != self.round.round_id {
            return Err(InvariantViolation::IllegalTransition {
                round_id: self.round.round_id,
                from: format!("round {}", self.round.round_id),
                to: format!("round {}", settled_round.round_id),
            });
        }
        self.round = settled_round;
        self.round.phase_deadline_ms = deadline_ms;
        self.wagers = settled_wagers;
        Ok(())
    }

    pub fn aggregates(&self) -> Option<&RoundAggregates> {
        self.round.aggregates.as_ref()
    }

    fn illegal(&self, to: RoundPhase) -> InvariantViolation {
        InvariantViolation::IllegalTransition {
            round_id: self.round.round_id,
            from: self.round.phase.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wager(round_id: u64, id: &str, player: &str, kind: &str, amount: u64) -> Wager {
        Wager {
            wager_id: id.to_string(),
            round_id,
            player_id: player.to_string(),
            bet_kind: BetKind::parse(kind).unwrap(),
            amount,
            status: WagerStatus::Pending,
            payout: 0,
            placed_at_ms: 0,
        }
    }

    fn red() -> Outcome {
        Outcome {
            sector: 1,
            kind: BetKind::parse("red").unwrap(),
        }
    }

    #[test]
    fn test_insert_tracks_counts_and_totals() {
        let mut round = ActiveRound::open(1, 0, 1_000);
        round.insert(wager(1, "a", "p1", "red", 10)).unwrap();
        round.insert(wager(1, "b", "p1", "green", 5)).unwrap();
        round.insert(wager(1, "c", "p2", "red", 7)).unwrap();

        assert_eq!(round.wager_count("p1"), 2);
        assert_eq!(round.wager_count("p2"), 1);
        assert_eq!(round.wager_count("nobody"), 0);
        assert_eq!(round.totals_by_kind()[&BetKind::parse("red").unwrap()], 17);
    }

    #[test]
    fn test_remove_reverses_insert() {
        let mut round = ActiveRound::open(1, 0, 1_000);
        round.insert(wager(1, "a", "p1", "red", 10)).unwrap();
        assert!(round.remove("a").is_some());
        assert_eq!(round.wager_count("p1"), 0);
        assert!(round.totals_by_kind().is_empty());
        assert!(round.remove("a").is_none());
    }

    #[test]
    fn test_withdraw_keeps_refunded_record() {
        let mut round = ActiveRound::open(1, 0, 1_000);
        round.insert(wager(1, "a", "p1", "red", 10)).unwrap();
        let withdrawn = round.withdraw("a").unwrap();
        assert_eq!(withdrawn.status, WagerStatus::Refunded);
        assert!(round.wagers().is_empty());
        assert_eq!(round.withdrawn(), &[withdrawn][..]);
        assert_eq!(round.wager_count("p1"), 0);
    }

    #[test]
    fn test_closed_at_never_after_deadline() {
        let mut late = ActiveRound::open(1, 0, 1_000);
        late.begin_drawing(red(), 1_450, 2_450).unwrap();
        assert_eq!(late.round().closed_at_ms, Some(1_000));

        let mut on_time = ActiveRound::open(1, 0, 1_000);
        on_time.begin_drawing(red(), 900, 1_900).unwrap();
        assert_eq!(on_time.round().closed_at_ms, Some(900));
    }

    #[test]
    fn test_rejects_foreign_wager() {
        let mut round = ActiveRound::open(2, 0, 1_000);
        assert!(matches!(
            round.insert(wager(1, "a", "p1", "red", 10)),
            Err(InvariantViolation::ForeignWager { .. })
        ));
    }

    #[test]
    fn test_admission_window() {
        let mut round = ActiveRound::open(1, 0, 1_000);
        assert!(round.accepts_wagers(999));
        assert!(!round.accepts_wagers(1_000));

        round.begin_drawing(red(), 1_000, 2_000).unwrap();
        assert!(!round.accepts_wagers(0));
        assert!(round.insert(wager(1, "late", "p1", "red", 10)).is_err());
    }

    #[test]
    fn test_outcome_is_immutable() {
        let mut round = ActiveRound::open(1, 0, 1_000);
        round.begin_drawing(red(), 1_000, 2_000).unwrap();
        assert!(matches!(
            round.begin_drawing(red(), 1_000, 2_000),
            Err(InvariantViolation::OutcomeAlreadyDrawn { round_id: 1 })
        ));
    }

    #[test]
    fn test_complete_requires_drawing() {
        let mut round = ActiveRound::open(1, 0, 1_000);
        let snapshot = round.round().clone();
        assert!(matches!(
            round.complete(snapshot, vec![], 3_000),
            Err(InvariantViolation::IllegalTransition { .. })
        ));
    }
}
