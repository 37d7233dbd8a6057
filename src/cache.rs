use std::sync::Arc;

use tokio::sync::RwLock;

use crate::message::Reading;

/// The most recently decoded reading, shared between the subscriber and the
/// HTTP handlers.
///
/// Replacement happens in a single assignment under the write lock, so a
/// reader sees either the previous reading or the new one, never a mix.
#[derive(Debug, Clone, Default)]
pub struct LatestReading {
    inner: Arc<RwLock<Reading>>,
}

impl LatestReading {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, reading: Reading) {
        *self.inner.write().await = reading;
    }

    pub async fn get(&self) -> Reading {
        self.inner.read().await.clone()
    }
}
