//! Round lifecycle and wager settlement

pub mod admission;
pub mod engine;
pub mod events;
pub mod recovery;
pub mod round;
pub mod sectors;
pub mod settlement;
pub mod types;

pub use engine::{EngineDeps, EngineHandle, RoundEngine, RoundSnapshot, RoundStateMachine};
pub use events::{EventBroadcaster, GameEvent};
pub use types::*;
