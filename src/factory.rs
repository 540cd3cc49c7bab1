//! Factory for assembling a running round engine
//!
//! Centralizes the startup order every entry point needs: open storage, run
//! crash recovery, then spawn the engine on the next free round id.

use crate::{
    common::{
        alerts::TracingAlertSink,
        clock::SystemClock,
        random::OsRandom,
        traits::{AlertSink, Clock, Ledger, RandomSource, RoundStore},
    },
    config::SpinwheelConfig,
    errors::SpinwheelResult,
    game_store::RocksStore,
    games::{
        engine::{EngineDeps, EngineHandle, RoundEngine, RoundStateMachine},
        events::EventBroadcaster,
        recovery::{recover, RecoveryReport},
    },
    ledger::{InMemoryLedger, RocksLedger},
    memory_store::MemoryStore,
    metrics::EngineMetrics,
};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Everything a transport layer needs from a started engine
pub struct RunningEngine {
    pub handle: EngineHandle,
    pub task: JoinHandle<()>,
    pub recovery: RecoveryReport,
    pub ledger: Arc<dyn Ledger>,
    pub store: Arc<dyn RoundStore>,
}

/// Optional overrides for the production collaborators
pub struct EngineOptions {
    pub clock: Arc<dyn Clock>,
    pub rng: Box<dyn RandomSource>,
    pub alerts: Arc<dyn AlertSink>,
    /// `false` leaves ticking to `EngineHandle::tick`
    pub auto_tick: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            rng: Box::new(OsRandom),
            alerts: Arc::new(TracingAlertSink),
            auto_tick: true,
        }
    }
}

pub struct EngineFactory;

impl EngineFactory {
    /// Recover abandoned rounds, then spawn the engine
    pub async fn create(
        config: SpinwheelConfig,
        store: Arc<dyn RoundStore>,
        ledger: Arc<dyn Ledger>,
        options: EngineOptions,
    ) -> SpinwheelResult<RunningEngine> {
        config.validate()?;

        let metrics = Arc::new(EngineMetrics::new()?);
        let events = EventBroadcaster::default();

        let recovery = recover(
            store.as_ref(),
            ledger.as_ref(),
            options.clock.as_ref(),
            &events,
            &metrics,
        )
        .await?;

        let tick_interval = options.auto_tick.then(|| config.tick_interval());
        let deps = EngineDeps {
            config,
            ledger: ledger.clone(),
            store: store.clone(),
            clock: options.clock,
            rng: options.rng,
            alerts: options.alerts,
            metrics,
            events,
        };

        let machine = RoundStateMachine::new(deps, recovery.next_round_id)?;
        let (handle, task) = RoundEngine::spawn(machine, tick_interval);

        Ok(RunningEngine {
            handle,
            task,
            recovery,
            ledger,
            store,
        })
    }

    /// RocksDB-backed engine; balances live in the same database as the rounds
    pub async fn create_persistent(config: SpinwheelConfig) -> SpinwheelResult<RunningEngine> {
        Self::create_persistent_with(config, EngineOptions::default()).await
    }

    pub async fn create_persistent_with(
        config: SpinwheelConfig,
        options: EngineOptions,
    ) -> SpinwheelResult<RunningEngine> {
        let store = RocksStore::open(
            &config.storage.data_directory,
            config.storage.clear_on_start,
        )?;
        let ledger = Arc::new(RocksLedger::new(
            store.storage().clone(),
            Some(config.game.starting_balance),
        ));
        Self::create(config, Arc::new(store), ledger, options).await
    }

    /// Nothing touches disk; for tests and demos
    pub async fn create_in_memory(
        config: SpinwheelConfig,
        options: EngineOptions,
    ) -> SpinwheelResult<RunningEngine> {
        let ledger = Arc::new(InMemoryLedger::with_starting_balance(
            config.game.starting_balance,
        ));
        Self::create(config, Arc::new(MemoryStore::new()), ledger, options).await
    }
}
