//! Round engine
//!
//! [`RoundStateMachine`] owns the active round. [`RoundEngine::spawn`] moves it
//! into one tokio task that serializes clock ticks and commands through a
//! single `select!` loop; everything else talks to it through an
//! [`EngineHandle`].

use crate::common::traits::{AlertSink, Clock, Ledger, RandomSource, RoundStore};
use crate::config::SpinwheelConfig;
use crate::errors::{AdmitError, EngineError, SpinwheelError, SpinwheelResult};
use crate::games::admission::{AdmissionController, AdmissionRules};
use crate::games::events::{EventBroadcaster, GameEvent};
use crate::games::round::ActiveRound;
use crate::games::sectors::{OutcomeGenerator, SectorTable};
use crate::games::settlement::{finalize, ApplyOutcome, PersistOutcome, RetryPolicy, SettlementEngine};
use crate::games::types::{
    BetKind, HistoryEntry, Outcome, RoundAggregates, RoundPhase, Wager, WagerReceipt, WagerRequest,
};
use crate::metrics::EngineMetrics;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 1_024;

/// Collaborators the engine is built from
pub struct EngineDeps {
    pub config: SpinwheelConfig,
    pub ledger: Arc<dyn Ledger>,
    pub store: Arc<dyn RoundStore>,
    pub clock: Arc<dyn Clock>,
    pub rng: Box<dyn RandomSource>,
    pub alerts: Arc<dyn AlertSink>,
    pub metrics: Arc<EngineMetrics>,
    pub events: EventBroadcaster,
}

/// State a newly connected client needs to render the wheel
#[derive(Clone, Debug, Serialize)]
pub struct RoundSnapshot {
    pub round_id: u64,
    pub phase: RoundPhase,
    pub phase_deadline_ms: i64,
    pub remaining_ms: i64,
    pub outcome: Option<Outcome>,
    pub wagers: Vec<Wager>,
    pub totals_by_kind: BTreeMap<BetKind, u64>,
    pub aggregates: Option<RoundAggregates>,
    pub payout_multipliers: BTreeMap<BetKind, u32>,
    /// Most recent first
    pub history: Vec<HistoryEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub round_id: u64,
    pub phase: RoundPhase,
    pub transitioned: bool,
}

pub struct RoundStateMachine {
    table: Arc<SectorTable>,
    active: ActiveRound,
    generator: OutcomeGenerator,
    admission: AdmissionController,
    settlement: Arc<SettlementEngine>,
    store: Arc<dyn RoundStore>,
    clock: Arc<dyn Clock>,
    events: EventBroadcaster,
    metrics: Arc<EngineMetrics>,
    history: VecDeque<HistoryEntry>,
    persist_tasks: Vec<JoinHandle<PersistOutcome>>,
    betting: Duration,
    drawing: Duration,
    cooldown: Duration,
    history_len: usize,
    store_timeout: Duration,
}

impl RoundStateMachine {
    /// Build the machine with `first_round_id` in BETTING. Nothing is
    /// persisted or announced until [`start`](Self::start).
    pub fn new(deps: EngineDeps, first_round_id: u64) -> SpinwheelResult<Self> {
        let EngineDeps {
            config,
            ledger,
            store,
            clock,
            rng,
            alerts,
            metrics,
            events,
        } = deps;
        config.validate()?;

        let table = Arc::new(SectorTable::from_config(&config.game)?);
        let admission = AdmissionController::new(
            AdmissionRules::from(&config.game),
            table.clone(),
            ledger.clone(),
            store.clone(),
            alerts.clone(),
            metrics.clone(),
            config.store_timeout(),
        );
        let settlement = Arc::new(SettlementEngine::new(
            ledger,
            store.clone(),
            alerts,
            clock.clone(),
            metrics.clone(),
            RetryPolicy::from(&config.settlement),
            config.store_timeout(),
        ));

        let now = clock.now_ms();
        let active = ActiveRound::open(
            first_round_id,
            now,
            now + config.betting_duration().as_millis() as i64,
        );

        Ok(Self {
            generator: OutcomeGenerator::new(table.clone(), rng),
            table,
            active,
            admission,
            settlement,
            store,
            clock,
            events,
            metrics,
            history: VecDeque::new(),
            persist_tasks: Vec::new(),
            betting: config.betting_duration(),
            drawing: config.drawing_duration(),
            cooldown: config.cooldown_duration(),
            history_len: config.monitoring.history_len,
            store_timeout: config.store_timeout(),
        })
    }

    pub fn settlement(&self) -> &Arc<SettlementEngine> {
        &self.settlement
    }

    pub fn round_id(&self) -> u64 {
        self.active.round_id()
    }

    pub fn phase(&self) -> RoundPhase {
        self.active.phase()
    }

    /// Persist and announce the first round
    pub async fn start(&mut self) {
        self.journal_open_round().await;
        self.metrics.current_round.set(self.active.round_id() as i64);
        info!(
            round_id = self.active.round_id(),
            deadline_ms = self.active.deadline_ms(),
            "Round engine started"
        );
        self.announce_phase();
    }

    /// Advance at most one phase if its deadline has passed, then publish a countdown
    pub async fn on_tick(&mut self) -> SpinwheelResult<TickReport> {
        let now = self.clock.now_ms();
        let mut transitioned = false;

        if now >= self.active.deadline_ms() {
            match self.active.phase() {
                RoundPhase::Betting => self.begin_drawing(now)?,
                RoundPhase::Drawing | RoundPhase::Settling => self.settle_round(now).await?,
                RoundPhase::Settled | RoundPhase::Voided => self.open_next_round(now).await,
            }
            transitioned = true;
        }

        let remaining_ms = (self.active.deadline_ms() - now).max(0);
        self.events.publish(GameEvent::Countdown {
            round_id: self.active.round_id(),
            phase: self.active.phase(),
            remaining_secs: ((remaining_ms + 999) / 1_000) as u64,
        });

        Ok(TickReport {
            round_id: self.active.round_id(),
            phase: self.active.phase(),
            transitioned,
        })
    }

    /// A wager arriving after the betting deadline closes betting first, so
    /// its rejection is never observed before the DRAWING transition
    pub async fn admit(&mut self, request: WagerRequest) -> Result<WagerReceipt, AdmitError> {
        let now = self.clock.now_ms();
        if self.active.phase() == RoundPhase::Betting && now >= self.active.deadline_ms() {
            self.begin_drawing(now)?;
        }
        let (receipt, wager) = self.admission.admit(&mut self.active, request, now).await?;
        self.events.publish(GameEvent::WagerAdmitted { wager });
        Ok(receipt)
    }

    pub fn snapshot(&self) -> RoundSnapshot {
        let round = self.active.round();
        RoundSnapshot {
            round_id: round.round_id,
            phase: round.phase,
            phase_deadline_ms: round.phase_deadline_ms,
            remaining_ms: (round.phase_deadline_ms - self.clock.now_ms()).max(0),
            outcome: round.outcome.clone(),
            wagers: self.active.wagers().to_vec(),
            totals_by_kind: self.active.totals_by_kind().clone(),
            aggregates: self.active.aggregates().cloned(),
            payout_multipliers: self
                .table
                .kinds()
                .filter_map(|k| self.table.multiplier(k).map(|m| (k.clone(), m)))
                .collect(),
            history: self.history.iter().cloned().collect(),
        }
    }

    /// Wait for every in-flight settlement write
    pub async fn flush_persistence(&mut self) -> Vec<PersistOutcome> {
        let mut outcomes = Vec::with_capacity(self.persist_tasks.len());
        for task in self.persist_tasks.drain(..) {
            match task.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "Settlement persistence task failed"),
            }
        }
        outcomes
    }

    fn begin_drawing(&mut self, now: i64) -> SpinwheelResult<()> {
        let outcome = self.generator.draw();
        let deadline = now + self.drawing.as_millis() as i64;
        self.active.begin_drawing(outcome.clone(), now, deadline)?;

        info!(
            round_id = self.active.round_id(),
            sector = outcome.sector,
            outcome = %outcome.kind,
            wagers = self.active.wagers().len(),
            "Betting closed, outcome drawn"
        );
        self.announce_phase();
        Ok(())
    }

    async fn settle_round(&mut self, now: i64) -> SpinwheelResult<()> {
        let settled = finalize(self.active.round(), self.active.wagers(), &self.table, now)?
            .with_withdrawn(self.active.withdrawn().to_vec());

        // The phase is announced before any credit lands
        let deadline = now + self.cooldown.as_millis() as i64;
        self.active
            .complete(settled.round().clone(), settled.wagers().to_vec(), deadline)?;
        self.announce_phase();

        let applied = self.settlement.apply(&settled).await;

        self.history.push_front(HistoryEntry {
            round_id: settled.round_id(),
            outcome: settled.outcome().clone(),
        });
        self.history.truncate(self.history_len);

        self.events.publish(GameEvent::RoundSettled {
            round_id: settled.round_id(),
            outcome: settled.outcome().clone(),
            wagers: settled.wagers().to_vec(),
            aggregates: settled.aggregates(),
        });

        if applied == ApplyOutcome::AlreadySettled {
            warn!(round_id = settled.round_id(), "Round was already settled in store");
            return Ok(());
        }

        // Outcomes are final in memory; the write must not hold up the next round
        self.persist_tasks.retain(|task| !task.is_finished());
        let settlement = self.settlement.clone();
        self.persist_tasks.push(tokio::spawn(async move {
            settlement.persist(&settled).await
        }));
        Ok(())
    }

    async fn open_next_round(&mut self, now: i64) {
        let next_id = self.active.round_id() + 1;
        self.active = ActiveRound::open(next_id, now, now + self.betting.as_millis() as i64);
        self.metrics.current_round.set(next_id as i64);
        self.metrics.active_wagers.set(0);

        self.journal_open_round().await;
        self.announce_phase();

        if !self.settlement.pending_reconciliation().is_empty() {
            let settlement = self.settlement.clone();
            self.persist_tasks.retain(|task| !task.is_finished());
            self.persist_tasks.push(tokio::spawn(async move {
                let persisted = settlement.retry_reconciliation().await;
                debug!(persisted, "Reconciliation retry finished");
                if settlement.pending_reconciliation().is_empty() {
                    PersistOutcome::Persisted { attempts: 1 }
                } else {
                    PersistOutcome::Parked { attempts: 1 }
                }
            }));
        }
    }

    /// Best effort; admission retries the write before the first wager is accepted
    async fn journal_open_round(&mut self) {
        let round = self.active.round().clone();
        match tokio::time::timeout(self.store_timeout, self.store.save_round(&round)).await {
            Ok(Ok(())) => self.active.mark_journaled(),
            Ok(Err(e)) => warn!(round_id = round.round_id, error = %e, "Could not persist new round"),
            Err(_) => warn!(round_id = round.round_id, "Persisting new round timed out"),
        }
    }

    fn announce_phase(&self) {
        let round = self.active.round();
        debug!(round_id = round.round_id, phase = %round.phase, "Phase changed");
        self.events.publish(GameEvent::PhaseChanged {
            round_id: round.round_id,
            phase: round.phase,
            deadline_ms: round.phase_deadline_ms,
            outcome: round.outcome.clone(),
        });
    }
}

/// Messages processed by the engine task
pub enum EngineCommand {
    Admit {
        request: WagerRequest,
        reply: oneshot::Sender<Result<WagerReceipt, AdmitError>>,
    },
    Snapshot {
        reply: oneshot::Sender<RoundSnapshot>,
    },
    Tick {
        reply: oneshot::Sender<SpinwheelResult<TickReport>>,
    },
    Flush {
        reply: oneshot::Sender<Vec<PersistOutcome>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct RoundEngine;

impl RoundEngine {
    /// Run `machine` on its own task. With `tick_interval = None` the engine
    /// only advances on [`EngineHandle::tick`].
    pub fn spawn(
        machine: RoundStateMachine,
        tick_interval: Option<Duration>,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = EngineHandle {
            commands,
            events: machine.events.clone(),
            metrics: machine.metrics.clone(),
            settlement: machine.settlement.clone(),
        };
        let task = tokio::spawn(run(machine, rx, tick_interval));
        (handle, task)
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run(
    mut machine: RoundStateMachine,
    mut commands: mpsc::Receiver<EngineCommand>,
    tick_interval: Option<Duration>,
) {
    machine.start().await;

    let mut ticker = tick_interval.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            _ = next_tick(&mut ticker) => {
                if let Err(e) = machine.on_tick().await {
                    error!(round_id = machine.round_id(), error = %e, "Tick failed; will retry");
                }
            }

            command = commands.recv() => {
                match command {
                    Some(EngineCommand::Admit { request, reply }) => {
                        let _ = reply.send(machine.admit(request).await);
                    }
                    Some(EngineCommand::Snapshot { reply }) => {
                        let _ = reply.send(machine.snapshot());
                    }
                    Some(EngineCommand::Tick { reply }) => {
                        let _ = reply.send(machine.on_tick().await);
                    }
                    Some(EngineCommand::Flush { reply }) => {
                        let _ = reply.send(machine.flush_persistence().await);
                    }
                    Some(EngineCommand::Shutdown { reply }) => {
                        machine.flush_persistence().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        machine.flush_persistence().await;
                        break;
                    }
                }
            }
        }
    }

    info!(round_id = machine.round_id(), "Round engine stopped");
}

/// Cloneable client of the engine task
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    events: EventBroadcaster,
    metrics: Arc<EngineMetrics>,
    settlement: Arc<SettlementEngine>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::NoReply)
    }

    pub async fn admit_wager(&self, request: WagerRequest) -> Result<WagerReceipt, AdmitError> {
        self.request(|reply| EngineCommand::Admit { request, reply })
            .await
            .map_err(|e| AdmitError::Internal(e.into()))?
    }

    pub async fn snapshot(&self) -> Result<RoundSnapshot, EngineError> {
        self.request(|reply| EngineCommand::Snapshot { reply }).await
    }

    /// Drive one tick by hand
    pub async fn tick(&self) -> SpinwheelResult<TickReport> {
        self.request(|reply| EngineCommand::Tick { reply })
            .await
            .map_err(SpinwheelError::from)?
    }

    /// Wait until every settled round has been written (or parked)
    pub async fn flush(&self) -> Result<Vec<PersistOutcome>, EngineError> {
        self.request(|reply| EngineCommand::Flush { reply }).await
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineCommand::Shutdown { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn settlement(&self) -> &Arc<SettlementEngine> {
        &self.settlement
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::alerts::RecordingAlertSink;
    use crate::common::clock::ManualClock;
    use crate::common::random::ScriptedRandom;
    use crate::errors::Rejection;
    use crate::ledger::InMemoryLedger;
    use crate::common::types::Credit;
    use crate::errors::LedgerError;
    use crate::games::types::WagerStatus;
    use crate::memory_store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Harness {
        machine: RoundStateMachine,
        clock: Arc<ManualClock>,
        ledger: Arc<InMemoryLedger>,
        store: Arc<MemoryStore>,
    }

    /// Sector script: 1 is red, 2 is black, 0 is green
    fn harness(script: Vec<usize>) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let ledger = Arc::new(InMemoryLedger::new());
        let store = Arc::new(MemoryStore::new());
        let deps = EngineDeps {
            config: SpinwheelConfig::default(),
            ledger: ledger.clone(),
            store: store.clone(),
            clock: clock.clone(),
            rng: Box::new(ScriptedRandom::new(script)),
            alerts: Arc::new(RecordingAlertSink::new()),
            metrics: Arc::new(EngineMetrics::new().unwrap()),
            events: EventBroadcaster::default(),
        };
        Harness {
            machine: RoundStateMachine::new(deps, 1).unwrap(),
            clock,
            ledger,
            store,
        }
    }

    #[tokio::test]
    async fn test_full_cycle_pays_winner() {
        let mut h = harness(vec![1]);
        h.ledger.open_account("alice", 100);
        h.machine.start().await;

        let receipt = h
            .machine
            .admit(WagerRequest::new("alice", "red", 30))
            .await
            .unwrap();
        assert_eq!(receipt.balance, 70);

        h.clock.advance(Duration::from_secs(25));
        let report = h.machine.on_tick().await.unwrap();
        assert!(report.transitioned);
        assert_eq!(report.phase, RoundPhase::Drawing);

        h.clock.advance(Duration::from_secs(5));
        assert_eq!(h.machine.on_tick().await.unwrap().phase, RoundPhase::Settled);
        assert_eq!(h.ledger.balance("alice").await, Ok(130));

        let snapshot = h.machine.snapshot();
        assert_eq!(snapshot.wagers[0].status, WagerStatus::Won);
        assert_eq!(snapshot.wagers[0].payout, 60);
        assert_eq!(snapshot.history.len(), 1);

        h.machine.flush_persistence().await;
        let stored = h.store.load_round(1).await.unwrap().unwrap();
        assert_eq!(stored.phase, RoundPhase::Settled);

        h.clock.advance(Duration::from_secs(5));
        let report = h.machine.on_tick().await.unwrap();
        assert_eq!(report.round_id, 2);
        assert_eq!(report.phase, RoundPhase::Betting);
    }

    #[tokio::test]
    async fn test_no_transition_before_deadline() {
        let mut h = harness(vec![1]);
        h.machine.start().await;
        h.clock.advance(Duration::from_secs(24));
        let report = h.machine.on_tick().await.unwrap();
        assert!(!report.transitioned);
        assert_eq!(report.phase, RoundPhase::Betting);
    }

    #[tokio::test]
    async fn test_late_wager_closes_betting_before_rejecting() {
        let mut h = harness(vec![1]);
        h.ledger.open_account("alice", 100);
        h.machine.start().await;

        h.clock.advance(Duration::from_millis(25_400));
        let err = h
            .machine
            .admit(WagerRequest::new("alice", "red", 10))
            .await
            .unwrap_err();
        assert_eq!(err.rejection(), Some(Rejection::BettingClosed));
        assert_eq!(h.ledger.balance("alice").await, Ok(100));

        assert_eq!(h.machine.phase(), RoundPhase::Drawing);
        let round = h.machine.active.round();
        assert_eq!(round.closed_at_ms, Some(1_025_000));
        assert_eq!(round.phase_deadline_ms, 1_030_400);
        assert!(!h.machine.on_tick().await.unwrap().transitioned);
    }

    struct WatchingLedger {
        inner: InMemoryLedger,
        events: Mutex<broadcast::Receiver<GameEvent>>,
        settled_seen_at_credit: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl Ledger for WatchingLedger {
        async fn debit(&self, player_id: &str, amount: u64) -> Result<u64, LedgerError> {
            self.inner.debit(player_id, amount).await
        }

        async fn credit(
            &self,
            player_id: &str,
            amount: u64,
            reference: &str,
        ) -> Result<Credit, LedgerError> {
            let mut seen = false;
            {
                let mut rx = self.events.lock().unwrap();
                while let Ok(event) = rx.try_recv() {
                    if let GameEvent::PhaseChanged {
                        phase: RoundPhase::Settled,
                        ..
                    } = event
                    {
                        seen = true;
                    }
                }
            }
            self.settled_seen_at_credit.lock().unwrap().push(seen);
            self.inner.credit(player_id, amount, reference).await
        }

        async fn balance(&self, player_id: &str) -> Result<u64, LedgerError> {
            self.inner.balance(player_id).await
        }
    }

    #[tokio::test]
    async fn test_settled_phase_is_published_before_credits() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let events = EventBroadcaster::default();
        let ledger = Arc::new(WatchingLedger {
            inner: InMemoryLedger::new(),
            events: Mutex::new(events.subscribe()),
            settled_seen_at_credit: Mutex::new(Vec::new()),
        });
        ledger.inner.open_account("alice", 100);
        let deps = EngineDeps {
            config: SpinwheelConfig::default(),
            ledger: ledger.clone(),
            store: Arc::new(MemoryStore::new()),
            clock: clock.clone(),
            rng: Box::new(ScriptedRandom::new(vec![1])),
            alerts: Arc::new(RecordingAlertSink::new()),
            metrics: Arc::new(EngineMetrics::new().unwrap()),
            events,
        };
        let mut machine = RoundStateMachine::new(deps, 1).unwrap();
        machine.start().await;
        machine
            .admit(WagerRequest::new("alice", "red", 30))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(25));
        machine.on_tick().await.unwrap();
        clock.advance(Duration::from_secs(5));
        machine.on_tick().await.unwrap();

        assert_eq!(*ledger.settled_seen_at_credit.lock().unwrap(), vec![true]);
        assert_eq!(ledger.balance("alice").await, Ok(130));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let mut h = harness(vec![0, 1, 2]);
        h.machine.start().await;
        for _ in 0..(3 * 25) {
            h.clock.advance(Duration::from_secs(25));
            h.machine.on_tick().await.unwrap();
        }
        let snapshot = h.machine.snapshot();
        assert!(snapshot.history.len() <= 20);
        assert!(!snapshot.history.is_empty());
        // newest first
        assert!(snapshot.history[0].round_id > snapshot.history[snapshot.history.len() - 1].round_id);
    }

    #[tokio::test]
    async fn test_actor_serializes_commands() {
        let h = harness(vec![2]);
        h.ledger.open_account("bob", 50);
        let (handle, task) = RoundEngine::spawn(h.machine, None);

        let receipt = handle
            .admit_wager(WagerRequest::new("bob", "black", 20))
            .await
            .unwrap();
        assert_eq!(receipt.round_id, 1);

        h.clock.advance(Duration::from_secs(25));
        handle.tick().await.unwrap();
        h.clock.advance(Duration::from_secs(5));
        handle.tick().await.unwrap();
        handle.flush().await.unwrap();

        assert_eq!(h.ledger.balance("bob").await, Ok(70));
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.phase, RoundPhase::Settled);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(
            handle.snapshot().await,
            Err(EngineError::Stopped) | Err(EngineError::NoReply)
        ));
    }
}
