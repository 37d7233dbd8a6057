use std::sync::Arc;

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::{
    cache::LatestReading,
    message::{self, DecodeError, Reading},
    store::ReadingStore,
    util::LogError,
};

/// Routes a raw payload through decode, cache update and persistence.
#[derive(Clone)]
pub struct Pipeline {
    cache: LatestReading,
    store: Arc<dyn ReadingStore>,
}

impl Pipeline {
    pub fn new(cache: LatestReading, store: Arc<dyn ReadingStore>) -> Self {
        Self { cache, store }
    }

    /// Decodes `payload` and makes it the latest reading before returning.
    ///
    /// The write to storage runs on its own task. Its outcome is only logged;
    /// the returned handle lets callers wait for it.
    pub async fn ingest(&self, payload: &[u8]) -> Result<JoinHandle<()>, DecodeError> {
        let reading = message::decode(payload)?;
        info!(
            "sensor `{}` reports fill level {}",
            reading.sensor_id, reading.fill_level
        );
        self.cache.set(reading.clone()).await;
        Ok(self.dispatch(reading))
    }

    /// Like [`Pipeline::ingest`], but logs and discards undecodable payloads.
    pub async fn ingest_or_discard(&self, payload: &[u8]) -> Option<JoinHandle<()>> {
        match self.ingest(payload).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(
                    "discarding payload {:?}: {}",
                    String::from_utf8_lossy(payload),
                    e
                );
                None
            }
        }
    }

    fn dispatch(&self, reading: Reading) -> JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            if store
                .append(&reading)
                .await
                .pipe_log(|| format!("failed to store reading from `{}`", reading.sensor_id))
                .is_ok()
            {
                debug!("stored reading from `{}`", reading.sensor_id);
            }
        })
    }
}
