//! Shared traits and interfaces
//!
//! The round engine only talks to its collaborators through these ports, so
//! storage, balances, time and randomness can all be swapped in tests.

use crate::common::types::{Credit, ReconciliationAlert};
use crate::errors::{LedgerError, SpinwheelResult};
use crate::games::types::{PlayerStats, Round, Wager};
use async_trait::async_trait;

/// Player balances. Both mutations are atomic per player.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Check-and-decrement; returns the new balance or `InsufficientFunds`
    async fn debit(&self, player_id: &str, amount: u64) -> Result<u64, LedgerError>;

    /// Applied at most once per `reference`; a repeat returns the balance with `applied: false`
    async fn credit(
        &self,
        player_id: &str,
        amount: u64,
        reference: &str,
    ) -> Result<Credit, LedgerError>;

    async fn balance(&self, player_id: &str) -> Result<u64, LedgerError>;
}

/// Durable round and wager records. Every write is an idempotent upsert by id.
#[async_trait]
pub trait RoundStore: Send + Sync {
    async fn save_round(&self, round: &Round) -> SpinwheelResult<()>;

    async fn save_wagers(&self, wagers: &[Wager]) -> SpinwheelResult<()>;

    /// Round plus all of its wagers in a single atomic write
    async fn save_settlement(&self, round: &Round, wagers: &[Wager]) -> SpinwheelResult<()>;

    async fn load_round(&self, round_id: u64) -> SpinwheelResult<Option<Round>>;

    async fn load_round_wagers(&self, round_id: u64) -> SpinwheelResult<Vec<Wager>>;

    /// Rounds not yet `SETTLED` or `VOIDED`, oldest first
    async fn unsettled_rounds(&self) -> SpinwheelResult<Vec<Round>>;

    async fn latest_round_id(&self) -> SpinwheelResult<Option<u64>>;

    /// Newest-first page of rounds; `cursor` comes from a previous call
    async fn recent_rounds(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> SpinwheelResult<(Vec<Round>, Option<String>)>;

    /// Newest-first wagers of one player
    async fn player_wagers(&self, player_id: &str, limit: usize) -> SpinwheelResult<Vec<Wager>>;

    async fn player_stats(&self, player_id: &str) -> SpinwheelResult<PlayerStats> {
        let wagers = self.player_wagers(player_id, usize::MAX).await?;
        Ok(PlayerStats::from_wagers(&wagers))
    }
}

/// Wall clock in Unix milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Uniform integer source; owned exclusively by the outcome generator
pub trait RandomSource: Send {
    /// Uniform value in `0..n`; `n` is never zero
    fn uniform(&mut self, n: usize) -> usize;
}

/// Operational alerting path for failures no player should see
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: ReconciliationAlert);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    // Mock implementation for testing
    struct FixedLedger {
        balance: AtomicU64,
        references: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl Ledger for FixedLedger {
        async fn debit(&self, _player_id: &str, amount: u64) -> Result<u64, LedgerError> {
            let balance = self.balance.load(Ordering::SeqCst);
            if balance < amount {
                return Err(LedgerError::InsufficientFunds {
                    balance,
                    requested: amount,
                });
            }
            Ok(self.balance.fetch_sub(amount, Ordering::SeqCst) - amount)
        }

        async fn credit(
            &self,
            _player_id: &str,
            amount: u64,
            reference: &str,
        ) -> Result<Credit, LedgerError> {
            if !self.references.lock().unwrap().insert(reference.to_string()) {
                return Ok(Credit {
                    balance: self.balance.load(Ordering::SeqCst),
                    applied: false,
                });
            }
            Ok(Credit {
                balance: self.balance.fetch_add(amount, Ordering::SeqCst) + amount,
                applied: true,
            })
        }

        async fn balance(&self, _player_id: &str) -> Result<u64, LedgerError> {
            Ok(self.balance.load(Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn test_ledger_trait_object() {
        let ledger: Box<dyn Ledger> = Box::new(FixedLedger {
            balance: AtomicU64::new(10),
            references: Mutex::new(HashSet::new()),
        });
        assert_eq!(ledger.debit("p", 4).await, Ok(6));
        assert!(ledger.debit("p", 7).await.is_err());
        assert_eq!(ledger.credit("p", 1, "r1").await.unwrap().balance, 7);
        assert!(!ledger.credit("p", 1, "r1").await.unwrap().applied);
        assert_eq!(ledger.balance("p").await, Ok(7));
    }
}
