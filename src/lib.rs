//! Spinwheel - Multiplayer Wheel-of-Fortune Round Engine
//!
//! One authoritative process runs a repeating BETTING → DRAWING → SETTLED
//! cycle. Wagers are admitted against an account ledger, outcomes are drawn
//! from a fixed sector table and settled rounds are persisted to RocksDB.

pub mod api;
pub mod common;
pub mod config;
pub mod errors;
pub mod factory;
pub mod game_store;
pub mod games;
pub mod ledger;
pub mod logging;
pub mod memory_store;
pub mod metrics;
pub mod storage;

pub use config::{ConfigLoader, SpinwheelConfig};
pub use errors::{AdmitError, Rejection, SpinwheelError, SpinwheelResult};
pub use factory::{EngineFactory, EngineOptions, RunningEngine};
pub use game_store::RocksStore;
pub use games::{EngineHandle, GameEvent, RoundSnapshot};
pub use ledger::{InMemoryLedger, RocksLedger};
pub use memory_store::MemoryStore;
