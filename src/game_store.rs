//! Persistent round and wager records stored in RocksDB.
//!
//! Key layout (all integers big-endian so lexicographic order is numeric):
//!
//! | key | value |
//! |---|---|
//! | `round:rec:` id | bincode `Round` |
//! | `round:open:` id | empty, present while the round is not terminal |
//! | `round:index:recent:` (MAX - id) | empty, newest-first index |
//! | `wager:` round_id wager_id | bincode `Wager` |
//! | `player:` len(player) player (MAX - round_id) wager_id | wager key |

use crate::{
    common::traits::RoundStore,
    errors::{SpinwheelError, SpinwheelResult, StorageError},
    games::types::{Round, Wager},
    storage::{KvStorage, StorageBatch},
};
use async_trait::async_trait;
use std::path::Path;

const ROUND_PREFIX: &[u8] = b"round:rec:";
const OPEN_ROUND_PREFIX: &[u8] = b"round:open:";
const RECENT_ROUNDS_PREFIX: &[u8] = b"round:index:recent:";
const WAGER_PREFIX: &[u8] = b"wager:";
const PLAYER_PREFIX: &[u8] = b"player:";

fn prefixed(prefix: &[u8], capacity: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + capacity);
    key.extend_from_slice(prefix);
    key
}

fn round_key(round_id: u64) -> Vec<u8> {
    let mut key = prefixed(ROUND_PREFIX, 8);
    key.extend_from_slice(&round_id.to_be_bytes());
    key
}

fn open_round_key(round_id: u64) -> Vec<u8> {
    let mut key = prefixed(OPEN_ROUND_PREFIX, 8);
    key.extend_from_slice(&round_id.to_be_bytes());
    key
}

fn recent_round_index_key(round_id: u64) -> Vec<u8> {
    // Inverted id sorts newest first
    let mut key = prefixed(RECENT_ROUNDS_PREFIX, 8);
    key.extend_from_slice(&(u64::MAX - round_id).to_be_bytes());
    key
}

fn round_wagers_prefix(round_id: u64) -> Vec<u8> {
    let mut key = prefixed(WAGER_PREFIX, 8);
    key.extend_from_slice(&round_id.to_be_bytes());
    key
}

fn wager_key(round_id: u64, wager_id: &str) -> Vec<u8> {
    let mut key = round_wagers_prefix(round_id);
    key.extend_from_slice(wager_id.as_bytes());
    key
}

fn player_prefix(player_id: &str) -> SpinwheelResult<Vec<u8>> {
    // Length-prefixed so one player id can never be a prefix of another's keys
    let len = u16::try_from(player_id.len()).map_err(|_| {
        SpinwheelError::Storage(StorageError::KeyTooLong(format!(
            "player id of {} bytes",
            player_id.len()
        )))
    })?;
    let mut key = prefixed(PLAYER_PREFIX, 2 + player_id.len());
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(player_id.as_bytes());
    Ok(key)
}

fn player_index_key(player_id: &str, round_id: u64, wager_id: &str) -> SpinwheelResult<Vec<u8>> {
    let mut key = player_prefix(player_id)?;
    key.extend_from_slice(&(u64::MAX - round_id).to_be_bytes());
    key.extend_from_slice(wager_id.as_bytes());
    Ok(key)
}

fn id_suffix(key: &[u8], prefix: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.get(prefix.len()..prefix.len() + 8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn put_round(batch: &mut StorageBatch, round: &Round) -> SpinwheelResult<()> {
    let bytes = bincode::serialize(round).map_err(|e| {
        SpinwheelError::Storage(StorageError::WriteFailed(format!(
            "Failed to encode round {}: {}",
            round.round_id, e
        )))
    })?;
    batch.put(round_key(round.round_id), bytes);
    batch.put(recent_round_index_key(round.round_id), b"");
    if round.phase.is_terminal() {
        batch.delete(open_round_key(round.round_id));
    } else {
        batch.put(open_round_key(round.round_id), b"");
    }
    Ok(())
}

fn put_wager(batch: &mut StorageBatch, wager: &Wager) -> SpinwheelResult<()> {
    let bytes = bincode::serialize(wager).map_err(|e| {
        SpinwheelError::Storage(StorageError::WriteFailed(format!(
            "Failed to encode wager {}: {}",
            wager.wager_id, e
        )))
    })?;
    let key = wager_key(wager.round_id, &wager.wager_id);
    batch.put(
        player_index_key(&wager.player_id, wager.round_id, &wager.wager_id)?,
        &key,
    );
    batch.put(key, bytes);
    Ok(())
}

fn decode_round(bytes: &[u8]) -> SpinwheelResult<Round> {
    bincode::deserialize(bytes).map_err(|e| {
        SpinwheelError::Storage(StorageError::CorruptedData(format!(
            "Failed to decode round: {}",
            e
        )))
    })
}

fn decode_wager(bytes: &[u8]) -> SpinwheelResult<Wager> {
    bincode::deserialize(bytes).map_err(|e| {
        SpinwheelError::Storage(StorageError::CorruptedData(format!(
            "Failed to decode wager: {}",
            e
        )))
    })
}

pub fn load_round(storage: &KvStorage, round_id: u64) -> SpinwheelResult<Option<Round>> {
    storage
        .get(&round_key(round_id))?
        .map(|bytes| decode_round(&bytes))
        .transpose()
}

pub fn load_round_wagers(storage: &KvStorage, round_id: u64) -> SpinwheelResult<Vec<Wager>> {
    storage
        .scan_prefix(&round_wagers_prefix(round_id), None, usize::MAX)?
        .iter()
        .map(|(_, value)| decode_wager(value))
        .collect()
}

pub fn load_recent_round_ids(
    storage: &KvStorage,
    cursor_hex: Option<&str>,
    limit: usize,
) -> SpinwheelResult<(Vec<u64>, Option<String>)> {
    let cursor_bytes = match cursor_hex {
        Some(c) => {
            let bytes = hex::decode(c)
                .map_err(|e| SpinwheelError::Storage(StorageError::InvalidCursor(e.to_string())))?;
            if !bytes.starts_with(RECENT_ROUNDS_PREFIX)
                || id_suffix(&bytes, RECENT_ROUNDS_PREFIX).is_none()
            {
                return Err(SpinwheelError::Storage(StorageError::InvalidCursor(
                    c.to_string(),
                )));
            }
            Some(bytes)
        }
        None => None,
    };

    let limit = limit.max(1);
    // One extra row tells us whether another page exists
    let rows = storage.scan_prefix(RECENT_ROUNDS_PREFIX, cursor_bytes.as_deref(), limit + 1)?;
    let has_more = rows.len() > limit;

    let mut round_ids = Vec::with_capacity(limit);
    let mut next_cursor = None;
    for (key, _value) in rows.into_iter().take(limit) {
        let Some(inv_id) = id_suffix(&key, RECENT_ROUNDS_PREFIX) else {
            continue;
        };
        round_ids.push(u64::MAX - inv_id);
        next_cursor = Some(hex::encode(&key));
    }

    Ok((round_ids, if has_more { next_cursor } else { None }))
}

/// `RoundStore` over RocksDB; blocking calls run on the blocking pool
#[derive(Clone)]
pub struct RocksStore {
    storage: KvStorage,
}

impl RocksStore {
    pub fn new(storage: KvStorage) -> Self {
        Self { storage }
    }

    pub fn open<P: AsRef<Path>>(path: P, clear_on_start: bool) -> SpinwheelResult<Self> {
        let storage = if clear_on_start {
            KvStorage::open_clean(path)?
        } else {
            KvStorage::open(path)?
        };
        Ok(Self::new(storage))
    }

    /// Shared database handle, e.g. for a ledger living in the same DB
    pub fn storage(&self) -> &KvStorage {
        &self.storage
    }

    async fn blocking<T, F>(&self, f: F) -> SpinwheelResult<T>
    where
        F: FnOnce(&KvStorage) -> SpinwheelResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || f(&storage))
            .await
            .map_err(|e| {
                SpinwheelError::Storage(StorageError::ReadFailed(format!(
                    "Storage task failed: {}",
                    e
                )))
            })?
    }
}

#[async_trait]
impl RoundStore for RocksStore {
    async fn save_round(&self, round: &Round) -> SpinwheelResult<()> {
        let round = round.clone();
        self.blocking(move |storage| {
            let mut batch = StorageBatch::new();
            put_round(&mut batch, &round)?;
            storage.write(batch)?;
            tracing::debug!(round_id = round.round_id, phase = %round.phase, "Saved round");
            Ok(())
        })
        .await
    }

    async fn save_wagers(&self, wagers: &[Wager]) -> SpinwheelResult<()> {
        if wagers.is_empty() {
            return Ok(());
        }
        let wagers = wagers.to_vec();
        self.blocking(move |storage| {
            let mut batch = StorageBatch::new();
            for wager in &wagers {
                put_wager(&mut batch, wager)?;
            }
            storage.write(batch)
        })
        .await
    }

    async fn save_settlement(&self, round: &Round, wagers: &[Wager]) -> SpinwheelResult<()> {
        let round = round.clone();
        let wagers = wagers.to_vec();
        self.blocking(move |storage| {
            let mut batch = StorageBatch::new();
            put_round(&mut batch, &round)?;
            for wager in &wagers {
                put_wager(&mut batch, wager)?;
            }
            let entries = batch.len();
            storage.write(batch)?;
            tracing::debug!(
                round_id = round.round_id,
                phase = %round.phase,
                wagers = wagers.len(),
                entries,
                "Wrote settlement batch"
            );
            Ok(())
        })
        .await
    }

    async fn load_round(&self, round_id: u64) -> SpinwheelResult<Option<Round>> {
        self.blocking(move |storage| load_round(storage, round_id)).await
    }

    async fn load_round_wagers(&self, round_id: u64) -> SpinwheelResult<Vec<Wager>> {
        self.blocking(move |storage| load_round_wagers(storage, round_id))
            .await
    }

    async fn unsettled_rounds(&self) -> SpinwheelResult<Vec<Round>> {
        self.blocking(|storage| {
            let mut rounds = Vec::new();
            for (key, _) in storage.scan_prefix(OPEN_ROUND_PREFIX, None, usize::MAX)? {
                let Some(round_id) = id_suffix(&key, OPEN_ROUND_PREFIX) else {
                    continue;
                };
                match load_round(storage, round_id)? {
                    Some(round) if !round.phase.is_terminal() => rounds.push(round),
                    Some(_) => {}
                    None => tracing::warn!(round_id, "Open-round marker without a round record"),
                }
            }
            Ok(rounds)
        })
        .await
    }

    async fn latest_round_id(&self) -> SpinwheelResult<Option<u64>> {
        self.blocking(|storage| {
            let (ids, _) = load_recent_round_ids(storage, None, 1)?;
            Ok(ids.first().copied())
        })
        .await
    }

    async fn recent_rounds(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> SpinwheelResult<(Vec<Round>, Option<String>)> {
        let cursor = cursor.map(str::to_string);
        self.blocking(move |storage| {
            let (ids, next) = load_recent_round_ids(storage, cursor.as_deref(), limit)?;
            let mut rounds = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(round) = load_round(storage, id)? {
                    rounds.push(round);
                }
            }
            Ok((rounds, next))
        })
        .await
    }

    async fn player_wagers(&self, player_id: &str, limit: usize) -> SpinwheelResult<Vec<Wager>> {
        let prefix = player_prefix(player_id)?;
        self.blocking(move |storage| {
            let mut wagers = Vec::new();
            for (_, wager_key) in storage.scan_prefix(&prefix, None, limit.max(1))? {
                if let Some(bytes) = storage.get(&wager_key)? {
                    wagers.push(decode_wager(&bytes)?);
                }
            }
            Ok(wagers)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_index_sorts_newest_first() {
        assert!(recent_round_index_key(10) < recent_round_index_key(9));
        assert!(round_key(9) < round_key(10));
    }

    #[test]
    fn test_player_prefix_is_unambiguous() {
        let a = player_index_key("a", 1, "w").unwrap();
        assert!(a.starts_with(&player_prefix("a").unwrap()));
        assert!(!player_index_key("a:b", 1, "w")
            .unwrap()
            .starts_with(&player_prefix("a").unwrap()));
    }

    #[test]
    fn test_oversized_player_id_is_refused() {
        let long = "x".repeat(usize::from(u16::MAX) + 4_465);
        assert!(matches!(
            player_prefix(&long),
            Err(SpinwheelError::Storage(StorageError::KeyTooLong(_)))
        ));
        // Would have wrapped to the 4_464-byte length
        assert!(player_prefix(&"x".repeat(4_464)).is_ok());
    }

    #[test]
    fn test_undecodable_cursor_is_invalid() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = KvStorage::open(dir.path()).unwrap();
        for cursor in ["zz", "00ff"] {
            assert!(matches!(
                load_recent_round_ids(&storage, Some(cursor), 10),
                Err(SpinwheelError::Storage(StorageError::InvalidCursor(_)))
            ));
        }
        let good = hex::encode(recent_round_index_key(3));
        assert!(load_recent_round_ids(&storage, Some(&good), 10).is_ok());
    }

    #[test]
    fn test_id_suffix_decoding() {
        let key = open_round_key(42);
        assert_eq!(id_suffix(&key, OPEN_ROUND_PREFIX), Some(42));
        assert_eq!(id_suffix(b"round:open:", OPEN_ROUND_PREFIX), None);
    }
}
