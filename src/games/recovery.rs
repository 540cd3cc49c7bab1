//! Startup recovery for rounds abandoned by a restart
//!
//! No round is resumed. A round journaled as SETTLING already had its outcome
//! and payouts fixed, so its winners are credited and it is closed as SETTLED.
//! Any other round found neither SETTLED nor VOIDED has its pending wagers
//! refunded and is closed as VOIDED.
//!
//! Credits carry the wager's payout or refund reference, so whatever the
//! ledger already applied before the crash, including credits from a previous
//! interrupted recovery, is not applied again.

use crate::common::traits::{Clock, Ledger, RoundStore};
use crate::errors::{InvariantViolation, SpinwheelResult};
use crate::games::events::{EventBroadcaster, GameEvent};
use crate::games::types::{Round, RoundPhase, Wager, WagerStatus};
use crate::metrics::EngineMetrics;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub voided_rounds: Vec<u64>,
    /// SETTLING rounds whose settlement was finished
    pub completed_rounds: Vec<u64>,
    pub refunded_wagers: usize,
    pub refunded_amount: u64,
    pub paid_amount: u64,
    /// First round id the engine should open
    pub next_round_id: u64,
}

pub async fn recover(
    store: &dyn RoundStore,
    ledger: &dyn Ledger,
    clock: &dyn Clock,
    events: &EventBroadcaster,
    metrics: &EngineMetrics,
) -> SpinwheelResult<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for round in store.unsettled_rounds().await? {
        if round.phase == RoundPhase::Settling {
            complete_settlement(round, store, ledger, events, metrics, &mut report).await?;
        } else {
            void_round(round, store, ledger, clock, events, metrics, &mut report).await?;
        }
    }

    report.next_round_id = store.latest_round_id().await?.map_or(1, |id| id + 1);

    if report.voided_rounds.is_empty() && report.completed_rounds.is_empty() {
        info!(next_round_id = report.next_round_id, "No abandoned rounds");
    } else {
        info!(
            voided = report.voided_rounds.len(),
            completed = report.completed_rounds.len(),
            refunded_wagers = report.refunded_wagers,
            refunded_amount = report.refunded_amount,
            paid_amount = report.paid_amount,
            next_round_id = report.next_round_id,
            "Recovery complete"
        );
    }
    Ok(report)
}

/// Refund one pending wager; returns whether the ledger applied it now
async fn refund(ledger: &dyn Ledger, wager: &mut Wager) -> SpinwheelResult<bool> {
    let credit = ledger
        .credit(&wager.player_id, wager.amount, &wager.refund_reference())
        .await?;
    wager.status = WagerStatus::Refunded;
    wager.payout = 0;
    info!(
        round_id = wager.round_id,
        wager_id = %wager.wager_id,
        player_id = %wager.player_id,
        amount = wager.amount,
        balance = credit.balance,
        applied = credit.applied,
        "Wager refunded"
    );
    Ok(credit.applied)
}

async fn void_round(
    mut round: Round,
    store: &dyn RoundStore,
    ledger: &dyn Ledger,
    clock: &dyn Clock,
    events: &EventBroadcaster,
    metrics: &EngineMetrics,
    report: &mut RecoveryReport,
) -> SpinwheelResult<()> {
    let round_id = round.round_id;
    warn!(round_id, phase = %round.phase, "Voiding round abandoned by restart");

    let mut wagers = store.load_round_wagers(round_id).await?;
    let mut refunded_wagers = 0;
    let mut refunded_amount = 0u64;

    for wager in wagers.iter_mut().filter(|w| w.is_pending()) {
        if refund(ledger, wager).await? {
            refunded_wagers += 1;
            refunded_amount = refunded_amount.saturating_add(wager.amount);
        }
        store.save_wagers(std::slice::from_ref(wager)).await?;
    }

    round.phase = RoundPhase::Voided;
    round.closed_at_ms = Some(clock.now_ms());
    round.phase_deadline_ms = clock.now_ms();
    store.save_settlement(&round, &wagers).await?;

    metrics.rounds_voided.inc();
    metrics.amount_refunded.inc_by(refunded_amount);
    events.publish(GameEvent::RoundVoided {
        round_id,
        refunded_wagers,
        refunded_amount,
    });

    report.voided_rounds.push(round_id);
    report.refunded_wagers += refunded_wagers;
    report.refunded_amount = report.refunded_amount.saturating_add(refunded_amount);
    Ok(())
}

async fn complete_settlement(
    mut round: Round,
    store: &dyn RoundStore,
    ledger: &dyn Ledger,
    events: &EventBroadcaster,
    metrics: &EngineMetrics,
    report: &mut RecoveryReport,
) -> SpinwheelResult<()> {
    let round_id = round.round_id;
    let outcome = round
        .outcome
        .clone()
        .ok_or(InvariantViolation::OutcomeNotDrawn { round_id })?;
    warn!(round_id, outcome = %outcome.kind, "Finishing settlement interrupted by restart");

    let mut wagers = store.load_round_wagers(round_id).await?;
    let mut paid = 0u64;
    let mut refunded_wagers = 0;
    let mut refunded_amount = 0u64;

    for wager in wagers.iter_mut() {
        match wager.status {
            WagerStatus::Won => {
                let credit = ledger
                    .credit(&wager.player_id, wager.payout, &wager.payout_reference())
                    .await?;
                if credit.applied {
                    paid = paid.saturating_add(wager.payout);
                }
                debug!(
                    round_id,
                    wager_id = %wager.wager_id,
                    payout = wager.payout,
                    applied = credit.applied,
                    "Payout credited"
                );
            }
            // A late admission record; the stake was never part of the settlement
            WagerStatus::Pending => {
                if refund(ledger, wager).await? {
                    refunded_wagers += 1;
                    refunded_amount = refunded_amount.saturating_add(wager.amount);
                }
            }
            WagerStatus::Lost | WagerStatus::Refunded => {}
        }
    }

    round.phase = RoundPhase::Settled;
    store.save_settlement(&round, &wagers).await?;

    metrics.rounds_settled.inc();
    metrics.amount_paid.inc_by(paid);
    metrics.amount_refunded.inc_by(refunded_amount);
    events.publish(GameEvent::RoundSettled {
        round_id,
        outcome,
        wagers: wagers
            .iter()
            .filter(|w| w.status != WagerStatus::Refunded)
            .cloned()
            .collect(),
        aggregates: round.aggregates.clone().unwrap_or_default(),
    });

    report.completed_rounds.push(round_id);
    report.paid_amount = report.paid_amount.saturating_add(paid);
    report.refunded_wagers += refunded_wagers;
    report.refunded_amount = report.refunded_amount.saturating_add(refunded_amount);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::ManualClock;
    use crate::games::types::{BetKind, Outcome, RoundAggregates};
    use crate::ledger::InMemoryLedger;
    use crate::memory_store::MemoryStore;

    fn wager(round_id: u64, id: &str, player: &str, amount: u64, status: WagerStatus) -> Wager {
        Wager {
            wager_id: id.to_string(),
            round_id,
            player_id: player.to_string(),
            bet_kind: BetKind::parse("red").unwrap(),
            amount,
            status,
            payout: 0,
            placed_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_voids_open_round_and_refunds() {
        let store = MemoryStore::new();
        let ledger = InMemoryLedger::new();
        ledger.open_account("alice", 70);
        ledger.open_account("bob", 0);

        store.save_round(&Round::open(3, 0, 1_000)).await.unwrap();
        store
            .save_wagers(&[
                wager(3, "a", "alice", 30, WagerStatus::Pending),
                wager(3, "b", "bob", 10, WagerStatus::Pending),
                // already refunded by an interrupted earlier recovery
                wager(3, "c", "bob", 5, WagerStatus::Refunded),
            ])
            .await
            .unwrap();

        let events = EventBroadcaster::new(8);
        let mut rx = events.subscribe();
        let metrics = EngineMetrics::new().unwrap();
        let report = recover(&store, &ledger, &ManualClock::new(5_000), &events, &metrics)
            .await
            .unwrap();

        assert_eq!(report.voided_rounds, vec![3]);
        assert_eq!(report.refunded_wagers, 2);
        assert_eq!(report.refunded_amount, 40);
        assert_eq!(report.next_round_id, 4);
        assert_eq!(ledger.balance("alice").await, Ok(100));
        assert_eq!(ledger.balance("bob").await, Ok(10));

        let round = store.load_round(3).await.unwrap().unwrap();
        assert_eq!(round.phase, RoundPhase::Voided);
        assert!(store
            .load_round_wagers(3)
            .await
            .unwrap()
            .iter()
            .all(|w| w.status == WagerStatus::Refunded));
        assert!(store.unsettled_rounds().await.unwrap().is_empty());

        assert_eq!(
            rx.recv().await.unwrap(),
            GameEvent::RoundVoided {
                round_id: 3,
                refunded_wagers: 2,
                refunded_amount: 40
            }
        );
        assert_eq!(metrics.rounds_voided.get(), 1);
    }

    #[tokio::test]
    async fn test_refund_already_applied_is_not_repeated() {
        let store = MemoryStore::new();
        let ledger = InMemoryLedger::new();
        ledger.open_account("alice", 60);

        // Admission compensated this stake, then its timed-out PENDING write landed
        let late = wager(2, "late", "alice", 40, WagerStatus::Pending);
        ledger.credit("alice", 40, &late.refund_reference()).await.unwrap();
        store.save_round(&Round::open(2, 0, 1_000)).await.unwrap();
        store.save_wagers(&[late]).await.unwrap();

        let report = recover(
            &store,
            &ledger,
            &ManualClock::new(0),
            &EventBroadcaster::default(),
            &EngineMetrics::new().unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(report.voided_rounds, vec![2]);
        assert_eq!(report.refunded_amount, 0);
        assert_eq!(ledger.balance("alice").await, Ok(100));
        let stored = store.load_round_wagers(2).await.unwrap();
        assert_eq!(stored[0].status, WagerStatus::Refunded);
    }

    #[tokio::test]
    async fn test_settling_round_is_completed_not_voided() {
        let store = MemoryStore::new();
        let ledger = InMemoryLedger::new();
        // alice staked 30 on red and was already paid before the crash; carol was not
        ledger.open_account("alice", 70);
        ledger.open_account("bob", 80);
        ledger.open_account("carol", 90);

        let mut round = Round::open(5, 0, 1_000);
        round.phase = RoundPhase::Settling;
        round.outcome = Some(Outcome {
            sector: 1,
            kind: BetKind::parse("red").unwrap(),
        });
        round.aggregates = Some(RoundAggregates {
            wager_count: 3,
            total_wagered: 60,
            total_paid: 80,
            winners: 2,
            ..Default::default()
        });
        let mut alice = wager(5, "a", "alice", 30, WagerStatus::Won);
        alice.payout = 60;
        let bob = wager(5, "b", "bob", 20, WagerStatus::Lost);
        let mut carol = wager(5, "c", "carol", 10, WagerStatus::Won);
        carol.payout = 20;
        store
            .save_settlement(&round, &[alice.clone(), bob, carol])
            .await
            .unwrap();
        ledger.credit("alice", 60, &alice.payout_reference()).await.unwrap();

        let events = EventBroadcaster::new(8);
        let mut rx = events.subscribe();
        let metrics = EngineMetrics::new().unwrap();
        let report = recover(&store, &ledger, &ManualClock::new(9_000), &events, &metrics)
            .await
            .unwrap();

        assert_eq!(report.completed_rounds, vec![5]);
        assert!(report.voided_rounds.is_empty());
        assert_eq!(report.paid_amount, 20);
        assert_eq!(report.refunded_amount, 0);
        assert_eq!(report.next_round_id, 6);
        assert_eq!(ledger.balance("alice").await, Ok(130));
        assert_eq!(ledger.balance("bob").await, Ok(80));
        assert_eq!(ledger.balance("carol").await, Ok(110));

        let stored = store.load_round(5).await.unwrap().unwrap();
        assert_eq!(stored.phase, RoundPhase::Settled);
        assert!(store.unsettled_rounds().await.unwrap().is_empty());
        match rx.recv().await.unwrap() {
            GameEvent::RoundSettled {
                round_id,
                wagers,
                aggregates,
                ..
            } => {
                assert_eq!(round_id, 5);
                assert_eq!(wagers.len(), 3);
                assert_eq!(aggregates.total_paid, 80);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let store = MemoryStore::new();
        let ledger = InMemoryLedger::new();
        ledger.open_account("alice", 0);
        store.save_round(&Round::open(1, 0, 1_000)).await.unwrap();
        store
            .save_wagers(&[wager(1, "a", "alice", 30, WagerStatus::Pending)])
            .await
            .unwrap();

        let events = EventBroadcaster::default();
        let metrics = EngineMetrics::new().unwrap();
        let clock = ManualClock::new(0);
        recover(&store, &ledger, &clock, &events, &metrics).await.unwrap();
        let again = recover(&store, &ledger, &clock, &events, &metrics).await.unwrap();

        assert!(again.voided_rounds.is_empty());
        assert_eq!(ledger.balance("alice").await, Ok(30));
    }

    #[tokio::test]
    async fn test_empty_store_starts_at_one() {
        let report = recover(
            &MemoryStore::new(),
            &InMemoryLedger::new(),
            &ManualClock::new(0),
            &EventBroadcaster::default(),
            &EngineMetrics::new().unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(report.next_round_id, 1);
    }
}
