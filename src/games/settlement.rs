//! Round settlement
//!
//! Settlement runs in three steps:
//! - [`finalize`] is pure. It fixes every wager's outcome and payout into an
//!   immutable [`SettledRound`].
//! - [`SettlementEngine::apply`] journals the round as SETTLING, then credits
//!   the winners at most once per round. Every credit carries the wager's
//!   payout reference, so a restart that finishes the round cannot pay twice.
//! - [`SettlementEngine::persist`] writes the round and all of its wagers in one
//!   atomic batch, retrying with backoff, and parks the round for
//!   reconciliation if the store stays down.

use crate::common::traits::{AlertSink, Clock, Ledger, RoundStore};
use crate::common::types::{Credit, ReconciliationAlert};
use crate::config::SettlementConfig;
use crate::errors::{InvariantViolation, LedgerError, SpinwheelError, SpinwheelResult, StorageError};
use crate::games::sectors::SectorTable;
use crate::games::types::{Outcome, Round, RoundAggregates, RoundPhase, Wager, WagerStatus};
use crate::metrics::EngineMetrics;
use dashmap::{DashMap, DashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Credited round ids older than this many rounds are forgotten; the store's
/// SETTLED record covers them by then
const CREDITED_WINDOW: u64 = 4_096;

/// Bounded exponential backoff
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl From<&SettlementConfig> for RetryPolicy {
    fn from(cfg: &SettlementConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base: Duration::from_millis(cfg.backoff_base_ms),
            max: Duration::from_millis(cfg.backoff_max_ms),
        }
    }
}

/// Final state of a round. Built only by [`finalize`], never mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettledRound {
    round: Round,
    outcome: Outcome,
    wagers: Vec<Wager>,
    /// Admissions undone before settlement, written as REFUNDED records
    withdrawn: Vec<Wager>,
}

impl SettledRound {
    /// Attach compensated admissions so the settlement batch overwrites any
    /// PENDING record of theirs that landed late
    pub fn with_withdrawn(mut self, withdrawn: Vec<Wager>) -> Self {
        self.withdrawn = withdrawn;
        self
    }

    pub fn withdrawn(&self) -> &[Wager] {
        &self.withdrawn
    }

    /// Every wager record the settlement batch writes
    pub fn records(&self) -> Vec<Wager> {
        self.wagers.iter().chain(&self.withdrawn).cloned().collect()
    }

    /// Round record journaled before any credit
    pub fn intent(&self) -> Round {
        let mut round = self.round.clone();
        round.phase = RoundPhase::Settling;
        round
    }

    pub fn round(&self) -> &Round {
        &self.round
    }

    pub fn round_id(&self) -> u64 {
        self.round.round_id
    }

    pub fn wagers(&self) -> &[Wager] {
        &self.wagers
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn aggregates(&self) -> RoundAggregates {
        self.round.aggregates.clone().unwrap_or_default()
    }

    pub fn winners(&self) -> impl Iterator<Item = &Wager> {
        self.wagers.iter().filter(|w| w.status == WagerStatus::Won)
    }
}

/// Decide every wager of a drawn round
pub fn finalize(
    round: &Round,
    wagers: &[Wager],
    table: &SectorTable,
    now_ms: i64,
) -> Result<SettledRound, InvariantViolation> {
    let round_id = round.round_id;
    if round.phase.is_terminal() {
        return Err(InvariantViolation::AlreadySettled { round_id });
    }
    let outcome = round
        .outcome
        .as_ref()
        .ok_or(InvariantViolation::OutcomeNotDrawn { round_id })?;
    if round.phase != RoundPhase::Drawing {
        return Err(InvariantViolation::IllegalTransition {
            round_id,
            from: round.phase.to_string(),
            to: RoundPhase::Settled.to_string(),
        });
    }

    let overflow = |what: &str| InvariantViolation::PayoutOverflow(format!("round {} {}", round_id, what));
    let mut aggregates = RoundAggregates::default();
    let mut settled = Vec::with_capacity(wagers.len());

    for wager in wagers {
        if wager.round_id != round_id {
            return Err(InvariantViolation::ForeignWager {
                wager_id: wager.wager_id.clone(),
                wager_round: wager.round_id,
                round_id,
            });
        }
        if !wager.is_pending() {
            return Err(InvariantViolation::AlreadySettled { round_id });
        }

        let mut wager = wager.clone();
        if wager.bet_kind == outcome.kind {
            wager.status = WagerStatus::Won;
            wager.payout = table.payout(&wager.bet_kind, wager.amount)?;
            aggregates.winners += 1;
        } else {
            wager.status = WagerStatus::Lost;
            wager.payout = 0;
        }

        aggregates.wager_count += 1;
        aggregates.total_wagered = aggregates
            .total_wagered
            .checked_add(wager.amount)
            .ok_or_else(|| overflow("total wagered"))?;
        aggregates.total_paid = aggregates
            .total_paid
            .checked_add(wager.payout)
            .ok_or_else(|| overflow("total paid"))?;
        let by_kind = aggregates
            .wagered_by_kind
            .entry(wager.bet_kind.clone())
            .or_default();
        *by_kind = by_kind
            .checked_add(wager.amount)
            .ok_or_else(|| overflow("kind total"))?;

        settled.push(wager);
    }

    let mut round = round.clone();
    round.phase = RoundPhase::Settled;
    round.phase_deadline_ms = now_ms;
    round.aggregates = Some(aggregates);

    Ok(SettledRound {
        round,
        outcome: outcome.clone(),
        wagers: settled,
        withdrawn: Vec::new(),
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Winners credited now. `unpaid` lists credits that failed for good.
    Credited { paid: u64, unpaid: Vec<(String, u64)> },
    /// This engine already credited the round
    AlreadyCredited,
    /// The store already holds the round as settled
    AlreadySettled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistOutcome {
    Persisted { attempts: u32 },
    /// Retries exhausted; the round waits in the reconciliation queue
    Parked { attempts: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettlementReport {
    pub round_id: u64,
    pub apply: ApplyOutcome,
    pub persist: Option<PersistOutcome>,
}

pub struct SettlementEngine {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn RoundStore>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
    policy: RetryPolicy,
    store_timeout: Duration,
    credited: DashSet<u64>,
    reconciliation: DashMap<u64, SettledRound>,
}

impl SettlementEngine {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn RoundStore>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        metrics: Arc<EngineMetrics>,
        policy: RetryPolicy,
        store_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            store,
            alerts,
            clock,
            metrics,
            policy,
            store_timeout,
            credited: DashSet::new(),
            reconciliation: DashMap::new(),
        }
    }

    /// `apply` then `persist`; a no-op for rounds the store already has settled
    pub async fn settle(&self, settled: &SettledRound) -> SettlementReport {
        let apply = self.apply(settled).await;
        let persist = match apply {
            ApplyOutcome::AlreadySettled => None,
            _ => Some(self.persist(settled).await),
        };
        SettlementReport {
            round_id: settled.round_id(),
            apply,
            persist,
        }
    }

    /// Credit every winner exactly once per round id
    ///
    /// A store that cannot be read does not stall the round: the in-memory
    /// guard and the ledger's payout references still rule out a second
    /// payout, so settlement goes ahead and an alert is raised.
    pub async fn apply(&self, settled: &SettledRound) -> ApplyOutcome {
        let round_id = settled.round_id();

        if !self.credited.insert(round_id) {
            debug!(round_id, "Round already credited; skipping payouts");
            return ApplyOutcome::AlreadyCredited;
        }

        match self.load_with_retry(round_id).await {
            Ok(Some(stored)) if stored.phase.is_terminal() => {
                info!(round_id, phase = %stored.phase, "Round already settled in store");
                return ApplyOutcome::AlreadySettled;
            }
            Ok(_) => {}
            Err(e) => {
                error!(round_id, error = %e, "Settled check unavailable; relying on credit references");
                self.raise(
                    round_id,
                    self.policy.max_attempts,
                    &format!("settled check skipped: {}", e),
                    Vec::new(),
                );
            }
        }
        self.credited
            .retain(|id| id.saturating_add(CREDITED_WINDOW) > round_id);

        self.journal_intent(settled).await;

        let mut paid = 0u64;
        let mut unpaid = Vec::new();
        for wager in settled.winners() {
            let reference = wager.payout_reference();
            match self
                .credit_with_retry(&wager.player_id, wager.payout, &reference)
                .await
            {
                Ok(Credit { balance, applied }) => {
                    if applied {
                        paid = paid.saturating_add(wager.payout);
                    }
                    debug!(
                        round_id,
                        wager_id = %wager.wager_id,
                        player_id = %wager.player_id,
                        payout = wager.payout,
                        balance,
                        applied,
                        "Payout credited"
                    );
                }
                Err(e) => {
                    error!(
                        round_id,
                        wager_id = %wager.wager_id,
                        player_id = %wager.player_id,
                        payout = wager.payout,
                        error = %e,
                        "Payout credit failed"
                    );
                    unpaid.push((wager.player_id.clone(), wager.payout));
                }
            }
        }

        if !unpaid.is_empty() {
            self.raise(round_id, self.policy.max_attempts, "payout credits failed", unpaid.clone());
        }

        self.metrics.amount_paid.inc_by(paid);
        self.metrics.rounds_settled.inc();
        info!(
            round_id,
            outcome = %settled.outcome().kind,
            sector = settled.outcome().sector,
            wagers = settled.wagers().len(),
            paid,
            "Round settled"
        );

        ApplyOutcome::Credited { paid, unpaid }
    }

    /// One bounded write of the SETTLING record; a restart finishes the round from it
    async fn journal_intent(&self, settled: &SettledRound) -> bool {
        let round_id = settled.round_id();
        let intent = settled.intent();
        let records = settled.records();
        match self
            .bounded(self.store.save_settlement(&intent, &records))
            .await
        {
            Ok(()) => {
                debug!(round_id, wagers = records.len(), "Settlement intent journaled");
                true
            }
            Err(e) => {
                warn!(round_id, error = %e, "Settlement intent not journaled");
                self.raise(
                    round_id,
                    1,
                    &format!("settlement intent not journaled: {}", e),
                    Vec::new(),
                );
                false
            }
        }
    }

    async fn load_with_retry(&self, round_id: u64) -> SpinwheelResult<Option<Round>> {
        let mut attempt = 1;
        loop {
            match self.bounded(self.store.load_round(round_id)).await {
                Ok(round) => return Ok(round),
                Err(e) if attempt < self.policy.max_attempts => {
                    warn!(round_id, attempt, error = %e, "Round lookup failed");
                    self.metrics.persistence_retries.inc();
                    tokio::time::sleep(self.policy.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn bounded<T>(&self, op: impl Future<Output = SpinwheelResult<T>>) -> SpinwheelResult<T> {
        match tokio::time::timeout(self.store_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(SpinwheelError::Storage(StorageError::Timeout(
                self.store_timeout.as_millis() as u64,
            ))),
        }
    }

    /// Write round and wagers atomically, retrying with backoff
    pub async fn persist(&self, settled: &SettledRound) -> PersistOutcome {
        let round_id = settled.round_id();
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            match self.store.save_settlement(settled.round(), &settled.records()).await {
                Ok(()) => {
                    if self.reconciliation.remove(&round_id).is_some() {
                        info!(round_id, "Reconciled round persisted");
                    }
                    self.metrics
                        .pending_reconciliation
                        .set(self.reconciliation.len() as i64);
                    return PersistOutcome::Persisted { attempts: attempt };
                }
                Err(e) => {
                    warn!(round_id, attempt, error = %e, "Settlement write failed");
                    last_error = e.to_string();
                    if attempt < self.policy.max_attempts {
                        self.metrics.persistence_retries.inc();
                        tokio::time::sleep(self.policy.delay(attempt)).await;
                    }
                }
            }
        }

        self.reconciliation.insert(round_id, settled.clone());
        self.metrics
            .pending_reconciliation
            .set(self.reconciliation.len() as i64);
        self.raise(
            round_id,
            self.policy.max_attempts,
            &format!("settlement not persisted: {}", last_error),
            Vec::new(),
        );
        PersistOutcome::Parked {
            attempts: self.policy.max_attempts,
        }
    }

    /// Re-persist parked rounds; credits are never repeated. Returns how many landed.
    pub async fn retry_reconciliation(&self) -> usize {
        let parked: Vec<SettledRound> = self
            .reconciliation
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut persisted = 0;
        for settled in parked {
            if let PersistOutcome::Persisted { .. } = self.persist(&settled).await {
                persisted += 1;
            }
        }
        persisted
    }

    /// Round ids waiting in the reconciliation queue, ascending
    pub fn pending_reconciliation(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.reconciliation.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    async fn credit_with_retry(
        &self,
        player_id: &str,
        amount: u64,
        reference: &str,
    ) -> Result<Credit, LedgerError> {
        let mut attempt = 1;
        loop {
            match self.ledger.credit(player_id, amount, reference).await {
                Ok(credit) => return Ok(credit),
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    self.metrics.credit_retries.inc();
                    tokio::time::sleep(self.policy.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn raise(&self, round_id: u64, attempts: u32, reason: &str, unpaid_credits: Vec<(String, u64)>) {
        self.metrics.reconciliation_alerts.inc();
        self.alerts.raise(ReconciliationAlert {
            round_id,
            attempts,
            reason: reason.to_string(),
            unpaid_credits,
            raised_at_ms: self.clock.now_ms(),
        });
    }
}
