//! Account ledgers
//!
//! [`InMemoryLedger`] keeps balances in a `DashMap`; every debit and credit runs
//! while holding the player's shard entry, so check-and-decrement is a single
//! atomic step. [`RocksLedger`] keeps them in RocksDB next to the round records.
//!
//! Credits carry a reference (`payout:<wager>`, `refund:<wager>`) and are
//! applied at most once per reference.

use crate::common::traits::Ledger;
use crate::common::types::Credit;
use crate::errors::{LedgerError, SpinwheelResult};
use crate::storage::{KvStorage, StorageBatch};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;

const BALANCE_PREFIX: &[u8] = b"ledger:balance:";
const CREDIT_PREFIX: &[u8] = b"ledger:credit:";

pub struct InMemoryLedger {
    balances: DashMap<String, u64>,
    applied: DashSet<String>,
    /// Balance for accounts seen for the first time; `None` rejects them
    auto_open: Option<u64>,
}

impl InMemoryLedger {
    /// Ledger that only knows explicitly opened accounts
    pub fn new() -> Self {
        Self {
            balances: DashMap::new(),
            applied: DashSet::new(),
            auto_open: None,
        }
    }

    /// Ledger that opens unknown accounts with `starting_balance`
    pub fn with_starting_balance(starting_balance: u64) -> Self {
        Self {
            balances: DashMap::new(),
            applied: DashSet::new(),
            auto_open: Some(starting_balance),
        }
    }

    /// Open or reset an account
    pub fn open_account(&self, player_id: &str, balance: u64) {
        self.balances.insert(player_id.to_string(), balance);
    }

    pub fn account_count(&self) -> usize {
        self.balances.len()
    }

    /// Sum of all balances, used by conservation checks
    pub fn total_balance(&self) -> u128 {
        self.balances.iter().map(|e| u128::from(*e.value())).sum()
    }

    fn with_account<T>(
        &self,
        player_id: &str,
        f: impl FnOnce(&mut u64) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        match self.auto_open {
            Some(start) => {
                let mut entry = self.balances.entry(player_id.to_string()).or_insert(start);
                f(entry.value_mut())
            }
            None => match self.balances.get_mut(player_id) {
                Some(mut entry) => f(entry.value_mut()),
                None => Err(LedgerError::UnknownAccount(player_id.to_string())),
            },
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn debit(&self, player_id: &str, amount: u64) -> Result<u64, LedgerError> {
        self.with_account(player_id, |balance| {
            if *balance < amount {
                return Err(LedgerError::InsufficientFunds {
                    balance: *balance,
                    requested: amount,
                });
            }
            *balance -= amount;
            Ok(*balance)
        })
    }

    async fn credit(
        &self,
        player_id: &str,
        amount: u64,
        reference: &str,
    ) -> Result<Credit, LedgerError> {
        self.with_account(player_id, |balance| {
            if self.applied.contains(reference) {
                return Ok(Credit {
                    balance: *balance,
                    applied: false,
                });
            }
            *balance = balance
                .checked_add(amount)
                .ok_or_else(|| LedgerError::Overflow(player_id.to_string()))?;
            self.applied.insert(reference.to_string());
            Ok(Credit {
                balance: *balance,
                applied: true,
            })
        })
    }

    async fn balance(&self, player_id: &str) -> Result<u64, LedgerError> {
        match self.balances.get(player_id) {
            Some(entry) => Ok(*entry.value()),
            None => self
                .auto_open
                .ok_or_else(|| LedgerError::UnknownAccount(player_id.to_string())),
        }
    }
}

fn balance_key(player_id: &str) -> Vec<u8> {
    [BALANCE_PREFIX, player_id.as_bytes()].concat()
}

fn credit_key(reference: &str) -> Vec<u8> {
    [CREDIT_PREFIX, reference.as_bytes()].concat()
}

fn unavailable(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Unavailable(e.to_string())
}

fn read_balance(
    storage: &KvStorage,
    player_id: &str,
    auto_open: Option<u64>,
) -> Result<u64, LedgerError> {
    match storage.get(&balance_key(player_id)).map_err(unavailable)? {
        Some(bytes) => {
            let raw: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| unavailable(format!("corrupted balance record for {}", player_id)))?;
            Ok(u64::from_be_bytes(raw))
        }
        None => auto_open.ok_or_else(|| LedgerError::UnknownAccount(player_id.to_string())),
    }
}

/// Ledger persisted in RocksDB
///
/// A balance update and its credit reference are written in one batch, so a
/// restart never sees a credit without its reference or the other way round.
#[derive(Clone)]
pub struct RocksLedger {
    storage: KvStorage,
    /// Held while one player's balance is read, checked and written
    locks: Arc<DashMap<String, ()>>,
    auto_open: Option<u64>,
}

impl RocksLedger {
    /// `auto_open` opens unknown accounts with that balance; `None` rejects them
    pub fn new(storage: KvStorage, auto_open: Option<u64>) -> Self {
        Self {
            storage,
            locks: Arc::new(DashMap::new()),
            auto_open,
        }
    }

    /// Open or reset an account
    pub fn open_account(&self, player_id: &str, balance: u64) -> SpinwheelResult<()> {
        self.storage
            .put(&balance_key(player_id), &balance.to_be_bytes())
    }

    async fn locked<T, F>(&self, player_id: &str, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&KvStorage, u64) -> Result<(T, StorageBatch), LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.storage.clone();
        let locks = self.locks.clone();
        let player_id = player_id.to_string();
        let auto_open = self.auto_open;
        tokio::task::spawn_blocking(move || {
            let _guard = locks.entry(player_id.clone()).or_default();
            let balance = read_balance(&storage, &player_id, auto_open)?;
            let (value, batch) = f(&storage, balance)?;
            if !batch.is_empty() {
                storage.write(batch).map_err(unavailable)?;
            }
            Ok(value)
        })
        .await
        .map_err(|e| unavailable(format!("ledger task failed: {}", e)))?
    }
}

#[async_trait]
impl Ledger for RocksLedger {
    async fn debit(&self, player_id: &str, amount: u64) -> Result<u64, LedgerError> {
        let key = balance_key(player_id);
        self.locked(player_id, move |_, balance| {
            if balance < amount {
                return Err(LedgerError::InsufficientFunds {
                    balance,
                    requested: amount,
                });
            }
            let next = balance - amount;
            let mut batch = StorageBatch::new();
            batch.put(key, next.to_be_bytes());
            Ok((next, batch))
        })
        .await
    }

    async fn credit(
        &self,
        player_id: &str,
        amount: u64,
        reference: &str,
    ) -> Result<Credit, LedgerError> {
        let key = balance_key(player_id);
        let reference_key = credit_key(reference);
        let overflow = LedgerError::Overflow(player_id.to_string());
        self.locked(player_id, move |storage, balance| {
            if storage.get(&reference_key).map_err(unavailable)?.is_some() {
                let credit = Credit {
                    balance,
                    applied: false,
                };
                return Ok((credit, StorageBatch::new()));
            }
            let next = balance.checked_add(amount).ok_or(overflow)?;
            let mut batch = StorageBatch::new();
            batch.put(key, next.to_be_bytes());
            batch.put(reference_key, b"");
            let credit = Credit {
                balance: next,
                applied: true,
            };
            Ok((credit, batch))
        })
        .await
    }

    async fn balance(&self, player_id: &str) -> Result<u64, LedgerError> {
        let storage = self.storage.clone();
        let player_id = player_id.to_string();
        let auto_open = self.auto_open;
        tokio::task::spawn_blocking(move || read_balance(&storage, &player_id, auto_open))
            .await
            .map_err(|e| unavailable(format!("ledger task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_debit_and_credit() {
        let ledger = InMemoryLedger::new();
        ledger.open_account("alice", 100);

        assert_eq!(ledger.debit("alice", 30).await, Ok(70));
        let credit = ledger.credit("alice", 60, "payout:w1").await.unwrap();
        assert_eq!(credit.balance, 130);
        assert!(credit.applied);
        assert_eq!(ledger.balance("alice").await, Ok(130));
    }

    #[tokio::test]
    async fn test_repeated_reference_credits_once() {
        let ledger = InMemoryLedger::new();
        ledger.open_account("alice", 100);

        ledger.credit("alice", 60, "payout:w1").await.unwrap();
        let again = ledger.credit("alice", 60, "payout:w1").await.unwrap();
        assert!(!again.applied);
        assert_eq!(again.balance, 160);
        ledger.credit("alice", 5, "refund:w2").await.unwrap();
        assert_eq!(ledger.balance("alice").await, Ok(165));
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_balance() {
        let ledger = InMemoryLedger::new();
        ledger.open_account("bob", 10);

        let err = ledger.debit("bob", 50).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientFunds {
                balance: 10,
                requested: 50
            }
        );
        assert_eq!(ledger.balance("bob").await, Ok(10));
    }

    #[tokio::test]
    async fn test_unknown_account_without_auto_open() {
        let ledger = InMemoryLedger::new();
        assert!(matches!(
            ledger.debit("ghost", 1).await,
            Err(LedgerError::UnknownAccount(_))
        ));
        assert_eq!(ledger.account_count(), 0);
    }

    #[tokio::test]
    async fn test_auto_open_uses_starting_balance() {
        let ledger = InMemoryLedger::with_starting_balance(1_000);
        assert_eq!(ledger.balance("new").await, Ok(1_000));
        assert_eq!(ledger.debit("new", 1).await, Ok(999));
        assert_eq!(ledger.account_count(), 1);
    }

    #[tokio::test]
    async fn test_credit_overflow() {
        let ledger = InMemoryLedger::new();
        ledger.open_account("whale", u64::MAX);
        assert!(matches!(
            ledger.credit("whale", 1, "payout:w").await,
            Err(LedgerError::Overflow(_))
        ));
        assert_eq!(ledger.balance("whale").await, Ok(u64::MAX));
    }

    #[tokio::test]
    async fn test_concurrent_debits_never_overdraw() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.open_account("carol", 100);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move { ledger.debit("carol", 7).await }));
        }

        let mut ok = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 14);
        assert_eq!(ledger.balance("carol").await, Ok(2));
    }

    #[tokio::test]
    async fn test_rocks_ledger_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let ledger = RocksLedger::new(KvStorage::open(dir.path()).unwrap(), Some(1_000));
            assert_eq!(ledger.debit("alice", 400).await, Ok(600));
            let credit = ledger.credit("alice", 50, "refund:w1").await.unwrap();
            assert_eq!(credit.balance, 650);
        }

        let ledger = RocksLedger::new(KvStorage::open(dir.path()).unwrap(), Some(1_000));
        assert_eq!(ledger.balance("alice").await, Ok(650));
        let again = ledger.credit("alice", 50, "refund:w1").await.unwrap();
        assert!(!again.applied);
        assert_eq!(ledger.balance("alice").await, Ok(650));
        assert_eq!(ledger.balance("fresh").await, Ok(1_000));
    }

    #[tokio::test]
    async fn test_rocks_ledger_rejects_unknown_and_overdraft() {
        let dir = TempDir::new().unwrap();
        let ledger = RocksLedger::new(KvStorage::open(dir.path()).unwrap(), None);
        assert!(matches!(
            ledger.debit("ghost", 1).await,
            Err(LedgerError::UnknownAccount(_))
        ));

        ledger.open_account("bob", 10).unwrap();
        assert_eq!(
            ledger.debit("bob", 11).await,
            Err(LedgerError::InsufficientFunds {
                balance: 10,
                requested: 11
            })
        );
        assert_eq!(ledger.balance("bob").await, Ok(10));
    }

    #[tokio::test]
    async fn test_rocks_ledger_concurrent_debits_never_overdraw() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(RocksLedger::new(KvStorage::open(dir.path()).unwrap(), None));
        ledger.open_account("carol", 100).unwrap();

        let mut handles = Vec::new();
        for _ in 0..30 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move { ledger.debit("carol", 7).await }));
        }
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 14);
        assert_eq!(ledger.balance("carol").await, Ok(2));
    }
}
