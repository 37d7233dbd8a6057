use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{ReadingRecord, ReadingStore, StorageError};
use crate::message::Reading;

#[inline]
fn default_capacity() -> usize {
    10_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Number of records kept before the oldest are dropped
    // optional, default: 10000
    #[serde(default = "default_capacity")]
    capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

/// Keeps recent records in process memory, for running without a database.
pub struct MemoryStore {
    capacity: usize,
    records: RwLock<VecDeque<ReadingRecord>>,
}

impl MemoryStore {
    pub fn new(config: Config) -> Self {
        Self {
            capacity: config.capacity,
            records: RwLock::new(VecDeque::new()),
        }
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn append(&self, reading: &Reading) -> Result<(), StorageError> {
        // Stamped under the lock so insertion order matches timestamp order.
        let mut records = self.records.write().await;
        let record = ReadingRecord {
            sensor_id: reading.sensor_id.clone(),
            nivel_lixo: reading.fill_level,
            data_hora: Utc::now(),
        };
        debug!("storing {:?} in memory", record);
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
        Ok(())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<ReadingRecord>, StorageError> {
        let records = self.records.read().await;
        Ok(records.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(capacity: usize) -> MemoryStore {
        MemoryStore::new(Config { capacity })
    }

    #[tokio::test]
    async fn lists_newest_first() {
        let store = store(100);
        for level in 0..5 {
            store
                .append(&Reading::new("CCBLX0001", level as f64))
                .await
                .unwrap();
        }

        let records = store.list_recent(50).await.unwrap();
        assert_eq!(records.len(), 5);
        assert!(records
            .windows(2)
            .all(|pair| pair[0].data_hora >= pair[1].data_hora));
        assert_eq!(records[0].nivel_lixo, 4.0);
        assert_eq!(records[4].nivel_lixo, 0.0);
    }

    #[tokio::test]
    async fn never_returns_more_than_limit() {
        let store = store(1000);
        for level in 0..120 {
            store
                .append(&Reading::new("CCBLX0002", level as f64))
                .await
                .unwrap();
        }

        let records = store.list_recent(50).await.unwrap();
        assert_eq!(records.len(), 50);
        assert_eq!(records[0].nivel_lixo, 119.0);
        assert_eq!(records[49].nivel_lixo, 70.0);
    }

    #[tokio::test]
    async fn drops_oldest_beyond_capacity() {
        let store = store(3);
        for level in 0..5 {
            store
                .append(&Reading::new("CCBLX0003", level as f64))
                .await
                .unwrap();
        }

        let levels: Vec<f64> = store
            .list_recent(50)
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.nivel_lixo)
            .collect();
        assert_eq!(levels, vec![4.0, 3.0, 2.0]);
    }

    #[tokio::test]
    async fn empty_store_lists_nothing() {
        assert!(store(10).list_recent(50).await.unwrap().is_empty());
    }
}
