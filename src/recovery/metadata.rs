use crate::error::UploadError;
use crate::state::{FileMap, UploadMap};
use crate::storage::StorageAdapter;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const KEY_PREFIX: &str = "uppyState:";

/// What survives a restart, apart from file payloads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedMetadata {
    pub current_uploads: UploadMap,
    pub files: FileMap,
    #[serde(default)]
    pub plugin_data: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    /// Unix millis
    expires: i64,
    metadata: SavedMetadata,
}

/// One JSON document per uploader id, with an expiry
#[derive(Clone)]
pub struct MetadataStore {
    storage: Arc<dyn StorageAdapter>,
    key: String,
    expiry: Duration,
}

impl MetadataStore {
    pub fn new(storage: Arc<dyn StorageAdapter>, uploader_id: &str, expiry: Duration) -> Self {
        Self {
            storage,
            key: format!("{}{}", KEY_PREFIX, uploader_id),
            expiry,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn save(&self, metadata: SavedMetadata) -> Result<(), UploadError> {
        let expires = Utc::now().timestamp_millis() + self.expiry.as_millis() as i64;
        let json = serde_json::to_vec(&Envelope { expires, metadata })?;
        self.storage.add(&self.key, Bytes::from(json)).await
    }

    /// `None` when nothing was saved, the entry expired, or it can't be parsed
    pub async fn load(&self) -> Result<Option<SavedMetadata>, UploadError> {
        let Some(raw) = self.storage.find_by_key(&self.key).await? else {
            return Ok(None);
        };

        let envelope: Envelope = match serde_json::from_slice(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Discarding unreadable saved state");
                self.storage.remove(&self.key).await?;
                return Ok(None);
            }
        };

        if envelope.expires <= Utc::now().timestamp_millis() {
            debug!(key = %self.key, "Saved state expired");
            self.storage.remove(&self.key).await?;
            return Ok(None);
        }
        Ok(Some(envelope.metadata))
    }

    pub async fn remove(&self) -> Result<(), UploadError> {
        self.storage.remove(&self.key).await
    }

    /// Drop expired or unreadable documents for every uploader id
    pub async fn cleanup(storage: &dyn StorageAdapter) -> Result<usize, UploadError> {
        let now = Utc::now().timestamp_millis();
        let mut removed = 0;

        for (key, raw) in storage.find_all().await? {
            if !key.starts_with(KEY_PREFIX) {
                continue;
            }
            let expired = serde_json::from_slice::<Envelope>(&raw)
                .map(|e| e.expires <= now)
                .unwrap_or(true);
            if expired {
                storage.remove(&key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_save_and_load() {
        let storage = Arc::new(MemoryStorage::new());
        let store = MetadataStore::new(storage.clone(), "uppy", Duration::from_secs(60));
        assert_eq!(store.key(), "uppyState:uppy");
        assert!(store.load().await.unwrap().is_none());

        let saved = SavedMetadata {
            plugin_data: serde_json::json!({"Transloadit": {"assembly": "a1"}}),
            ..Default::default()
        };
        store.save(saved.clone()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(saved));
    }

    #[tokio::test]
    async fn test_expired_state_is_dropped() {
        let storage = Arc::new(MemoryStorage::new());
        let store = MetadataStore::new(storage.clone(), "uppy", Duration::ZERO);
        store.save(SavedMetadata::default()).await.unwrap();

        assert!(store.load().await.unwrap().is_none());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_only_touches_own_keys() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .add("uppyState:old", Bytes::from_static(b"not json"))
            .await
            .unwrap();
        storage
            .add("unrelated", Bytes::from_static(b"keep"))
            .await
            .unwrap();
        MetadataStore::new(storage.clone(), "live", Duration::from_secs(60))
            .save(SavedMetadata::default())
            .await
            .unwrap();

        let removed = MetadataStore::cleanup(storage.as_ref()).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(storage.len(), 2);
    }
}
