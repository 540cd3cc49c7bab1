//! Common utilities and shared functionality
//!
//! Ports the round engine depends on, plus the small adapters (clocks,
//! random sources, alert sinks) that need no storage of their own.

pub mod alerts;
pub mod clock;
pub mod random;
pub mod traits;
pub mod types;
