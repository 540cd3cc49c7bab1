//! Error types for the Spinwheel round engine
//!
//! Rejections are expected and user-facing; everything else is an operational
//! or programming failure surfaced through [`SpinwheelError`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Root error type for all Spinwheel operations
#[derive(Debug, thiserror::Error)]
pub enum SpinwheelError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Persistence port errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Account ledger errors
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Broken engine invariants (programming errors, never guessed around)
    #[error("Invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    /// Engine task / channel errors
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Metrics error: {0}")]
    Metrics(String),
}

/// Configuration and validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

/// Storage system errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("Database open failed: {0}")]
    DatabaseOpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    #[error("Storage timed out after {0}ms")]
    Timeout(u64),

    /// Caller-supplied pagination cursor that does not decode
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Key component too long: {0}")]
    KeyTooLong(String),
}

/// Account ledger errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: u64, requested: u64 },

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Balance overflow for account {0}")]
    Overflow(String),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

impl LedgerError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

/// Invariant violations: the engine refuses the operation instead of guessing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("Round {round_id} has no outcome yet")]
    OutcomeNotDrawn { round_id: u64 },

    #[error("Round {round_id} outcome already drawn")]
    OutcomeAlreadyDrawn { round_id: u64 },

    #[error("Round {round_id} already settled")]
    AlreadySettled { round_id: u64 },

    #[error("Round {round_id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        round_id: u64,
        from: String,
        to: String,
    },

    #[error("Wager {wager_id} belongs to round {wager_round}, not {round_id}")]
    ForeignWager {
        wager_id: String,
        wager_round: u64,
        round_id: u64,
    },

    #[error("Payout overflow for wager {0}")]
    PayoutOverflow(String),

    #[error("Unknown bet kind in settlement: {0}")]
    UnknownBetKind(String),
}

/// Engine task / channel errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Engine is not running")]
    Stopped,

    #[error("Engine did not reply")]
    NoReply,
}

/// User-facing wager rejection reasons, in validation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rejection {
    BettingClosed,
    InvalidBetKind,
    AmountOutOfRange,
    MaxBetsExceeded,
    InsufficientBalance,
}

impl Rejection {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::BettingClosed => "BETTING_CLOSED",
            Rejection::InvalidBetKind => "INVALID_BET_KIND",
            Rejection::AmountOutOfRange => "AMOUNT_OUT_OF_RANGE",
            Rejection::MaxBetsExceeded => "MAX_BETS_EXCEEDED",
            Rejection::InsufficientBalance => "INSUFFICIENT_BALANCE",
        }
    }

    pub fn all() -> [Rejection; 5] {
        [
            Rejection::BettingClosed,
            Rejection::InvalidBetKind,
            Rejection::AmountOutOfRange,
            Rejection::MaxBetsExceeded,
            Rejection::InsufficientBalance,
        ]
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::BettingClosed => write!(f, "Betting is closed for this round"),
            Rejection::InvalidBetKind => write!(f, "Unknown bet kind"),
            Rejection::AmountOutOfRange => write!(f, "Bet amount outside allowed range"),
            Rejection::MaxBetsExceeded => write!(f, "Maximum wagers for this round reached"),
            Rejection::InsufficientBalance => write!(f, "Insufficient balance"),
        }
    }
}

/// Outcome of a failed `admit` call
#[derive(Debug, thiserror::Error)]
pub enum AdmitError {
    #[error("Wager rejected: {0}")]
    Rejected(Rejection),

    #[error("Wager could not be processed: {0}")]
    Internal(#[from] SpinwheelError),
}

impl AdmitError {
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            AdmitError::Rejected(r) => Some(*r),
            AdmitError::Internal(_) => None,
        }
    }
}

impl From<Rejection> for AdmitError {
    fn from(r: Rejection) -> Self {
        AdmitError::Rejected(r)
    }
}

// External error conversions
impl From<rocksdb::Error> for SpinwheelError {
    fn from(e: rocksdb::Error) -> Self {
        SpinwheelError::Storage(StorageError::WriteFailed(e.to_string()))
    }
}

impl From<bincode::Error> for SpinwheelError {
    fn from(e: bincode::Error) -> Self {
        SpinwheelError::Storage(StorageError::CorruptedData(e.to_string()))
    }
}

impl From<std::io::Error> for SpinwheelError {
    fn from(e: std::io::Error) -> Self {
        SpinwheelError::Storage(StorageError::ReadFailed(e.to_string()))
    }
}

impl From<prometheus::Error> for SpinwheelError {
    fn from(e: prometheus::Error) -> Self {
        SpinwheelError::Metrics(e.to_string())
    }
}

impl From<serde_json::Error> for SpinwheelError {
    fn from(e: serde_json::Error) -> Self {
        SpinwheelError::Configuration(ConfigurationError::LoadFailed(e.to_string()))
    }
}

// Convenience type alias for Results
pub type SpinwheelResult<T> = Result<T, SpinwheelError>;
