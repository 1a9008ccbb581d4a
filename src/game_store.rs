//! Persisted round and wager records
//!
//! Records are immutable once written. The RocksDB layout keeps a newest-first
//! round index (inverted round id) and a per-player wager index so history
//! queries are prefix scans.

use crate::errors::StoreError;
use crate::games::types::{round_amount, PlayerId, RoundId, RoundRecord, WagerId, WagerRecord};
use crate::storage::RocksStorage;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

const ROUND_RECORD_PREFIX: &[u8] = b"round:record:";
const RECENT_ROUNDS_PREFIX: &[u8] = b"round:index:recent:";
const ROUND_WAGERS_PREFIX: &[u8] = b"wager:round:";
const PLAYER_WAGERS_PREFIX: &[u8] = b"wager:player:";
const HOUSE_STATS_KEY: &[u8] = b"stats:house";

/// Aggregate house performance across all settled rounds
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HouseStats {
    pub total_rounds: u64,
    pub aborted_rounds: u64,
    pub total_bets: u64,
    pub total_staked: f64,
    pub total_paid: f64,
    pub house_profit: f64,
    pub actual_rtp: f64,
}

impl HouseStats {
    fn absorb(&mut self, round: &RoundRecord) {
        self.total_rounds += 1;
        if round.aborted {
            self.aborted_rounds += 1;
        }
        self.total_bets += u64::from(round.total_players);
        self.total_staked = round_amount(self.total_staked + round.total_bet);
        self.total_paid = round_amount(self.total_paid + round.total_payout);
        self.house_profit = round_amount(self.total_staked - self.total_paid);
        self.actual_rtp = if self.total_staked > 0.0 {
            self.total_paid / self.total_staked
        } else {
            0.0
        };
    }
}

/// Round/wager persistence collaborator
#[async_trait]
pub trait GameStore: Send + Sync {
    /// Idempotent per wager id
    async fn persist_wager(&self, record: &WagerRecord) -> Result<(), StoreError>;

    /// Idempotent per round id; aggregates are counted once
    async fn persist_round(&self, record: &RoundRecord) -> Result<(), StoreError>;

    async fn load_round(&self, round_id: RoundId) -> Result<Option<RoundRecord>, StoreError>;

    /// Newest first
    async fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundRecord>, StoreError>;

    /// In placement order
    async fn round_wagers(&self, round_id: RoundId) -> Result<Vec<WagerRecord>, StoreError>;

    /// Newest first
    async fn player_wagers(
        &self,
        player: PlayerId,
        limit: usize,
    ) -> Result<Vec<WagerRecord>, StoreError>;

    async fn latest_round_id(&self) -> Result<Option<RoundId>, StoreError>;

    async fn house_stats(&self) -> Result<HouseStats, StoreError>;
}

/// In-memory store for development and tests
#[derive(Default)]
pub struct MemoryGameStore {
    rounds: DashMap<RoundId, RoundRecord>,
    wagers: DashMap<WagerId, WagerRecord>,
    stats: Mutex<HouseStats>,
    failing_writes: AtomicU32,
}

impl MemoryGameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::WriteFailed("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl GameStore for MemoryGameStore {
    async fn persist_wager(&self, record: &WagerRecord) -> Result<(), StoreError> {
        self.check_write()?;
        self.wagers.entry(record.id).or_insert_with(|| record.clone());
        Ok(())
    }

    async fn persist_round(&self, record: &RoundRecord) -> Result<(), StoreError> {
        self.check_write()?;
        let mut stats = self
            .stats
            .lock()
            .map_err(|_| StoreError::WriteFailed("stats lock poisoned".to_string()))?;
        if self.rounds.contains_key(&record.round_id) {
            return Ok(());
        }
        self.rounds.insert(record.round_id, record.clone());
        stats.absorb(record);
        Ok(())
    }

    async fn load_round(&self, round_id: RoundId) -> Result<Option<RoundRecord>, StoreError> {
        Ok(self.rounds.get(&round_id).map(|r| r.clone()))
    }

    async fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundRecord>, StoreError> {
        let mut rounds: Vec<RoundRecord> = self.rounds.iter().map(|r| r.clone()).collect();
        rounds.sort_by(|a, b| b.round_id.cmp(&a.round_id));
        rounds.truncate(limit);
        Ok(rounds)
    }

    async fn round_wagers(&self, round_id: RoundId) -> Result<Vec<WagerRecord>, StoreError> {
        let mut wagers: Vec<WagerRecord> = self
            .wagers
            .iter()
            .filter(|w| w.round_id == round_id)
            .map(|w| w.clone())
            .collect();
        wagers.sort_by_key(|w| w.bet_number);
        Ok(wagers)
    }

    async fn player_wagers(
        &self,
        player: PlayerId,
        limit: usize,
    ) -> Result<Vec<WagerRecord>, StoreError> {
        let mut wagers: Vec<WagerRecord> = self
            .wagers
            .iter()
            .filter(|w| w.player_id == player)
            .map(|w| w.clone())
            .collect();
        wagers.sort_by(|a, b| b.round_id.cmp(&a.round_id));
        wagers.truncate(limit);
        Ok(wagers)
    }

    async fn latest_round_id(&self) -> Result<Option<RoundId>, StoreError> {
        Ok(self.rounds.iter().map(|r| r.round_id).max())
    }

    async fn house_stats(&self) -> Result<HouseStats, StoreError> {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .map_err(|_| StoreError::ReadFailed("stats lock poisoned".to_string()))
    }
}

fn round_record_key(round_id: RoundId) -> Vec<u8> {
    let mut key = Vec::with_capacity(ROUND_RECORD_PREFIX.len() + 8);
    key.extend_from_slice(ROUND_RECORD_PREFIX);
    key.extend_from_slice(&round_id.0.to_be_bytes());
    key
}

fn recent_round_index_key(round_id: RoundId) -> Vec<u8> {
    // Newest first: prefix | inv_round(be)
    let mut key = Vec::with_capacity(RECENT_ROUNDS_PREFIX.len() + 8);
    key.extend_from_slice(RECENT_ROUNDS_PREFIX);
    key.extend_from_slice(&(u64::MAX - round_id.0).to_be_bytes());
    key
}

fn round_wager_prefix(round_id: RoundId) -> Vec<u8> {
    let mut key = Vec::with_capacity(ROUND_WAGERS_PREFIX.len() + 8);
    key.extend_from_slice(ROUND_WAGERS_PREFIX);
    key.extend_from_slice(&round_id.0.to_be_bytes());
    key
}

fn round_wager_key(record: &WagerRecord) -> Vec<u8> {
    let mut key = round_wager_prefix(record.round_id);
    key.extend_from_slice(&record.bet_number.to_be_bytes());
    key
}

fn player_wager_prefix(player: PlayerId) -> Vec<u8> {
    let mut key = Vec::with_capacity(PLAYER_WAGERS_PREFIX.len() + 9);
    key.extend_from_slice(PLAYER_WAGERS_PREFIX);
    key.extend_from_slice(&player.0.to_be_bytes());
    key.push(b':');
    key
}

fn player_wager_key(record: &WagerRecord) -> Vec<u8> {
    // prefix | inv_round(be) | bet_number(be)
    let mut key = player_wager_prefix(record.player_id);
    key.extend_from_slice(&(u64::MAX - record.round_id.0).to_be_bytes());
    key.extend_from_slice(&record.bet_number.to_be_bytes());
    key
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8], what: &str) -> Result<T, StoreError> {
    serde_json::from_slice(bytes)
        .map_err(|e| StoreError::CorruptedData(format!("Failed to decode {}: {}", what, e)))
}

fn encode<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value)
        .map_err(|e| StoreError::WriteFailed(format!("Failed to encode {}: {}", what, e)))
}

/// RocksDB-backed store
pub struct RocksGameStore {
    storage: RocksStorage,
    // Serializes the existence check with the stats update
    round_write: Mutex<()>,
}

impl RocksGameStore {
    pub fn new(storage: RocksStorage) -> Self {
        Self {
            storage,
            round_write: Mutex::new(()),
        }
    }

    fn stored_stats(&self) -> Result<HouseStats, StoreError> {
        match self.storage.get(HOUSE_STATS_KEY)? {
            Some(bytes) => decode(&bytes, "house stats"),
            None => Ok(HouseStats::default()),
        }
    }
}

#[async_trait]
impl GameStore for RocksGameStore {
    async fn persist_wager(&self, record: &WagerRecord) -> Result<(), StoreError> {
        let bytes = encode(record, &format!("wager {}", record.id))?;
        self.storage.batch_write(&[
            (round_wager_key(record), bytes.clone()),
            (player_wager_key(record), bytes),
        ])
    }

    async fn persist_round(&self, record: &RoundRecord) -> Result<(), StoreError> {
        let _guard = self
            .round_write
            .lock()
            .map_err(|_| StoreError::WriteFailed("round write lock poisoned".to_string()))?;

        let key = round_record_key(record.round_id);
        if self.storage.get(&key)?.is_some() {
            return Ok(());
        }

        let mut stats = self.stored_stats()?;
        stats.absorb(record);

        self.storage.batch_write(&[
            (key, encode(record, &format!("round {}", record.round_id))?),
            (recent_round_index_key(record.round_id), record.round_id.0.to_be_bytes().to_vec()),
            (HOUSE_STATS_KEY.to_vec(), encode(&stats, "house stats")?),
        ])
    }

    async fn load_round(&self, round_id: RoundId) -> Result<Option<RoundRecord>, StoreError> {
        match self.storage.get(&round_record_key(round_id))? {
            Some(bytes) => Ok(Some(decode(&bytes, &format!("round {}", round_id))?)),
            None => Ok(None),
        }
    }

    async fn recent_rounds(&self, limit: usize) -> Result<Vec<RoundRecord>, StoreError> {
        let rows = self.storage.scan_prefix(RECENT_ROUNDS_PREFIX, limit)?;
        let mut rounds = Vec::with_capacity(rows.len());
        for (_key, value) in rows {
            let id_bytes: [u8; 8] = value.as_slice().try_into().map_err(|_| {
                StoreError::CorruptedData("round index entry must be 8 bytes".to_string())
            })?;
            if let Some(round) = self.load_round(RoundId(u64::from_be_bytes(id_bytes))).await? {
                rounds.push(round);
            }
        }
        Ok(rounds)
    }

    async fn round_wagers(&self, round_id: RoundId) -> Result<Vec<WagerRecord>, StoreError> {
        self.storage
            .scan_prefix(&round_wager_prefix(round_id), usize::MAX)?
            .iter()
            .map(|(_, value)| decode(value, "wager"))
            .collect()
    }

    async fn player_wagers(
        &self,
        player: PlayerId,
        limit: usize,
    ) -> Result<Vec<WagerRecord>, StoreError> {
        self.storage
            .scan_prefix(&player_wager_prefix(player), limit)?
            .iter()
            .map(|(_, value)| decode(value, "wager"))
            .collect()
    }

    async fn latest_round_id(&self) -> Result<Option<RoundId>, StoreError> {
        let rows = self.storage.scan_prefix(RECENT_ROUNDS_PREFIX, 1)?;
        Ok(rows.first().and_then(|(_, value)| {
            let bytes: [u8; 8] = value.as_slice().try_into().ok()?;
            Some(RoundId(u64::from_be_bytes(bytes)))
        }))
    }

    async fn house_stats(&self) -> Result<HouseStats, StoreError> {
        self.stored_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::types::WagerStatus;
    use chrono::Utc;
    use tempfile::TempDir;

    fn round(id: u64, bet: f64, payout: f64) -> RoundRecord {
        RoundRecord {
            round_id: RoundId(id),
            multiplier: 2.5,
            crashed_at: 2.5,
            total_players: 2,
            total_bet: bet,
            total_payout: payout,
            aborted: false,
            started_at: Utc::now(),
            timestamp: Utc::now(),
            fairness: None,
        }
    }

    fn wager(round_id: u64, player: i64, bet_number: u32) -> WagerRecord {
        WagerRecord {
            id: WagerId::new(),
            round_id: RoundId(round_id),
            bet_number,
            player_id: PlayerId(player),
            amount: 10.0,
            coefficient: 2.5,
            cashout_multiplier: Some(2.0),
            auto_cashout: Some(2.0),
            win_amount: 20.0,
            status: WagerStatus::CashedOut,
            created_at: Utc::now(),
            ended_at: Utc::now(),
        }
    }

    async fn exercise(store: &dyn GameStore) {
        store.persist_round(&round(1, 100.0, 50.0)).await.unwrap();
        store.persist_round(&round(2, 100.0, 140.0)).await.unwrap();
        store.persist_round(&round(3, 50.0, 0.0)).await.unwrap();
        // Retried write must not double count
        store.persist_round(&round(3, 50.0, 0.0)).await.unwrap();

        let recent = store.recent_rounds(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].round_id, RoundId(3));
        assert_eq!(recent[1].round_id, RoundId(2));
        assert_eq!(store.latest_round_id().await.unwrap(), Some(RoundId(3)));

        let stats = store.house_stats().await.unwrap();
        assert_eq!(stats.total_rounds, 3);
        assert_eq!(stats.total_staked, 250.0);
        assert_eq!(stats.total_paid, 190.0);
        assert_eq!(stats.house_profit, 60.0);
        assert!((stats.actual_rtp - 0.76).abs() < 1e-9);

        store.persist_wager(&wager(1, 7, 2)).await.unwrap();
        store.persist_wager(&wager(1, 8, 1)).await.unwrap();
        store.persist_wager(&wager(2, 7, 1)).await.unwrap();

        let in_round = store.round_wagers(RoundId(1)).await.unwrap();
        assert_eq!(in_round.len(), 2);
        assert_eq!(in_round[0].bet_number, 1);

        let player = store.player_wagers(PlayerId(7), 10).await.unwrap();
        assert_eq!(player.len(), 2);
        assert_eq!(player[0].round_id, RoundId(2));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryGameStore::new();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_rocks_store() {
        let dir = TempDir::new().unwrap();
        let store = RocksGameStore::new(RocksStorage::new(dir.path()).unwrap());
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_rocks_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RocksGameStore::new(RocksStorage::new(dir.path()).unwrap());
            store.persist_round(&round(41, 10.0, 0.0)).await.unwrap();
        }
        let store = RocksGameStore::new(RocksStorage::new(dir.path()).unwrap());
        assert_eq!(store.latest_round_id().await.unwrap(), Some(RoundId(41)));
        assert!(store.load_round(RoundId(41)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_injected_write_failures() {
        let store = MemoryGameStore::new();
        store.fail_next_writes(1);
        assert!(store.persist_round(&round(1, 1.0, 0.0)).await.is_err());
        assert!(store.persist_round(&round(1, 1.0, 0.0)).await.is_ok());
        assert_eq!(store.house_stats().await.unwrap().total_rounds, 1);
    }
}
