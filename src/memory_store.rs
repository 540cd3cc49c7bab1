//! In-memory `RoundStore`
//!
//! Same semantics as the RocksDB store without durability. Reads and writes can
//! be made to fail on demand, which is how the retry and compensation paths are
//! tested.

use crate::{
    common::traits::RoundStore,
    errors::{SpinwheelError, SpinwheelResult, StorageError},
    games::types::{Round, Wager},
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct MemoryState {
    rounds: BTreeMap<u64, Round>,
    /// (round_id, wager_id) -> wager
    wagers: BTreeMap<(u64, String), Wager>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    passing_writes: AtomicU32,
    failing_writes: AtomicU32,
    failing_reads: AtomicU32,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write calls fail with `WriteFailed`
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes_after(0, n);
    }

    /// Let `pass` more writes through, then fail the following `fail`
    pub fn fail_writes_after(&self, pass: u32, fail: u32) {
        self.passing_writes.store(pass, Ordering::SeqCst);
        self.failing_writes.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` read calls fail with `ReadFailed`; zero clears
    pub fn fail_next_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Successful write calls so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_write(&self) -> SpinwheelResult<()> {
        let injected = !take_one(&self.passing_writes) && take_one(&self.failing_writes);
        if injected {
            return Err(SpinwheelError::Storage(StorageError::WriteFailed(
                "injected write failure".to_string(),
            )));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn check_read(&self) -> SpinwheelResult<()> {
        if take_one(&self.failing_reads) {
            return Err(SpinwheelError::Storage(StorageError::ReadFailed(
                "injected read failure".to_string(),
            )));
        }
        Ok(())
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl RoundStore for MemoryStore {
    async fn save_round(&self, round: &Round) -> SpinwheelResult<()> {
        self.check_write()?;
        self.state
            .write()
            .await
            .rounds
            .insert(round.round_id, round.clone());
        Ok(())
    }

    async fn save_wagers(&self, wagers: &[Wager]) -> SpinwheelResult<()> {
        self.check_write()?;
        let mut state = self.state.write().await;
        for wager in wagers {
            state
                .wagers
                .insert((wager.round_id, wager.wager_id.clone()), wager.clone());
        }
        Ok(())
    }

    async fn save_settlement(&self, round: &Round, wagers: &[Wager]) -> SpinwheelResult<()> {
        self.check_write()?;
        let mut state = self.state.write().await;
        state.rounds.insert(round.round_id, round.clone());
        for wager in wagers {
            state
                .wagers
                .insert((wager.round_id, wager.wager_id.clone()), wager.clone());
        }
        Ok(())
    }

    async fn load_round(&self, round_id: u64) -> SpinwheelResult<Option<Round>> {
        self.check_read()?;
        Ok(self.state.read().await.rounds.get(&round_id).cloned())
    }

    async fn load_round_wagers(&self, round_id: u64) -> SpinwheelResult<Vec<Wager>> {
        self.check_read()?;
        let state = self.state.read().await;
        Ok(state
            .wagers
            .range((round_id, String::new())..)
            .take_while(|((r, _), _)| *r == round_id)
            .map(|(_, w)| w.clone())
            .collect())
    }

    async fn unsettled_rounds(&self) -> SpinwheelResult<Vec<Round>> {
        self.check_read()?;
        let state = self.state.read().await;
        Ok(state
            .rounds
            .values()
            .filter(|r| !r.phase.is_terminal())
            .cloned()
            .collect())
    }

    async fn latest_round_id(&self) -> SpinwheelResult<Option<u64>> {
        Ok(self.state.read().await.rounds.keys().next_back().copied())
    }

    async fn recent_rounds(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> SpinwheelResult<(Vec<Round>, Option<String>)> {
        let before = match cursor {
            Some(c) => Some(c.parse::<u64>().map_err(|e| {
                SpinwheelError::Storage(StorageError::InvalidCursor(format!("{}: {}", c, e)))
            })?),
            None => None,
        };

        let state = self.state.read().await;
        let limit = limit.max(1);
        let mut rounds: Vec<Round> = state
            .rounds
            .range(..before.unwrap_or(u64::MAX))
            .rev()
            .take(limit + 1)
            .map(|(_, r)| r.clone())
            .collect();

        let next = if rounds.len() > limit {
            rounds.truncate(limit);
            rounds.last().map(|r| r.round_id.to_string())
        } else {
            None
        };
        Ok((rounds, next))
    }

    async fn player_wagers(&self, player_id: &str, limit: usize) -> SpinwheelResult<Vec<Wager>> {
        let state = self.state.read().await;
        Ok(state
            .wagers
            .values()
            .rev()
            .filter(|w| w.player_id == player_id)
            .take(limit.max(1))
            .cloned()
            .collect())
    }
}
