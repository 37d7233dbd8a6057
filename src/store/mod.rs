mod memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Reading;

pub use memory::{Config as MemoryConfig, MemoryStore};
pub use postgres::{Config as PostgresConfig, PostgresStore};

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("fail to connect to database `{host}`: {source}")]
    Connect {
        host: String,
        source: tokio_postgres::Error,
    },
    #[error("fail to initialize table `{table}`: {source}")]
    Init {
        table: String,
        source: tokio_postgres::Error,
    },
    #[error("query on table `{table}` failed: {source}")]
    Query {
        table: String,
        source: tokio_postgres::Error,
    },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// A reading as it was recorded, stamped by the storage side.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReadingRecord {
    pub sensor_id: String,
    pub nivel_lixo: f64,
    pub data_hora: DateTime<Utc>,
}

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Appends a reading. The record timestamp is assigned here.
    async fn append(&self, reading: &Reading) -> Result<(), StorageError>;

    /// Returns at most `limit` records, newest first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<ReadingRecord>, StorageError>;
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum StoreConfig {
    Memory(MemoryConfig),
    Postgres(PostgresConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory(MemoryConfig::default())
    }
}

impl StoreConfig {
    pub async fn into_store(self) -> Arc<dyn ReadingStore> {
        match self {
            StoreConfig::Memory(config) => Arc::new(MemoryStore::new(config)),
            StoreConfig::Postgres(config) => Arc::new(PostgresStore::new(config).await),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A store whose database is never reachable.
    pub struct UnreachableStore;

    #[async_trait]
    impl ReadingStore for UnreachableStore {
        async fn append(&self, _reading: &Reading) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("database is down".to_string()))
        }

        async fn list_recent(&self, _limit: usize) -> Result<Vec<ReadingRecord>, StorageError> {
            Err(StorageError::Unavailable("database is down".to_string()))
        }
    }
}
