//! Shared type definitions used by the ports

use serde::{Deserialize, Serialize};

/// A round whose settlement could not be persisted and needs an operator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationAlert {
    pub round_id: u64,
    pub attempts: u32,
    pub reason: String,
    /// Players whose payout credit failed, with the amount owed
    pub unpaid_credits: Vec<(String, u64)>,
    pub raised_at_ms: i64,
}

/// Result of a referenced ledger credit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credit {
    /// Balance after the call
    pub balance: u64,
    /// `false` when the reference had already been credited
    pub applied: bool,
}

/// Current Unix timestamp in milliseconds
pub fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(current_timestamp_ms() > 1_577_836_800_000);
    }
}
