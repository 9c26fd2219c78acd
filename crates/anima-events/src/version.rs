use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::error::{EventStoreError, Result};
use crate::event::Event;
use crate::store::EventStore;

/// Append helper that stamps the next per-stream version.
///
/// Reads the stream tail, stamps `last + 1`, and appends. A version
/// conflict means another writer won the race; the version is refreshed
/// and the append retried once; conflicts are recoverable by contract.
#[derive(Clone)]
pub struct EventWriter {
    store: Arc<dyn EventStore>,
}

impl EventWriter {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub async fn append(
        &self,
        stream_id: &str,
        event_type: &str,
        payload: Value,
        correlation_id: Option<&str>,
    ) -> Result<Event> {
        let mut event = Event::new(stream_id, event_type, payload);
        if let Some(corr) = correlation_id {
            event = event.with_correlation(corr);
        }

        let version = self.next_version(stream_id).await?;
        let stamped = event.clone().with_version(version);
        match self.store.append(stamped.clone()).await {
            Ok(()) => Ok(stamped),
            Err(EventStoreError::VersionConflict { .. }) => {
                let refreshed = self.next_version(stream_id).await?;
                debug!(
                    stream_id,
                    refreshed, "version conflict on append, retrying with refreshed version"
                );
                let retried = event.with_version(refreshed);
                self.store.append(retried.clone()).await?;
                Ok(retried)
            }
            Err(e) => Err(e),
        }
    }

    async fn next_version(&self, stream_id: &str) -> Result<u32> {
        Ok(self
            .store
            .get_last_event(stream_id)
            .await?
            .map(|e| e.version() + 1)
            .unwrap_or(0))
    }
}
