use crate::error::UploadError;
use crate::storage::StorageAdapter;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const EXPIRY_PREFIX_LEN: usize = 8;

/// File payloads keyed `<store>!<fileId>`, each prefixed with its expiry
/// (little-endian unix millis)
#[derive(Clone)]
pub struct BlobStore {
    storage: Arc<dyn StorageAdapter>,
    name: String,
    expiry: Duration,
}

fn split_expiry(raw: &Bytes) -> Option<(i64, Bytes)> {
    if raw.len() < EXPIRY_PREFIX_LEN {
        return None;
    }
    let mut prefix = [0u8; EXPIRY_PREFIX_LEN];
    prefix.copy_from_slice(&raw[..EXPIRY_PREFIX_LEN]);
    Some((i64::from_le_bytes(prefix), raw.slice(EXPIRY_PREFIX_LEN..)))
}

impl BlobStore {
    pub fn new(storage: Arc<dyn StorageAdapter>, name: &str, expiry: Duration) -> Self {
        Self {
            storage,
            name: name.to_string(),
            expiry,
        }
    }

    fn key(&self, file_id: &str) -> String {
        format!("{}!{}", self.name, file_id)
    }

    fn prefix(&self) -> String {
        format!("{}!", self.name)
    }

    pub async fn put(&self, file_id: &str, data: Bytes) -> Result<(), UploadError> {
        let expires = Utc::now().timestamp_millis() + self.expiry.as_millis() as i64;
        let mut value = BytesMut::with_capacity(EXPIRY_PREFIX_LEN + data.len());
        value.put_i64_le(expires);
        value.put(data);
        self.storage.add(&self.key(file_id), value.freeze()).await
    }

    pub async fn get(&self, file_id: &str) -> Result<Option<Bytes>, UploadError> {
        let key = self.key(file_id);
        let Some(raw) = self.storage.find_by_key(&key).await? else {
            return Ok(None);
        };
        match split_expiry(&raw) {
            Some((expires, data)) if expires > Utc::now().timestamp_millis() => Ok(Some(data)),
            _ => {
                self.storage.remove(&key).await?;
                Ok(None)
            }
        }
    }

    /// Live payloads of this store, by file id
    pub async fn list(&self) -> Result<HashMap<String, Bytes>, UploadError> {
        let prefix = self.prefix();
        let now = Utc::now().timestamp_millis();

        Ok(self
            .storage
            .find_all()
            .await?
            .into_iter()
            .filter_map(|(key, raw)| {
                let file_id = key.strip_prefix(&prefix)?.to_string();
                let (expires, data) = split_expiry(&raw)?;
                (expires > now).then_some((file_id, data))
            })
            .collect())
    }

    pub async fn delete(&self, file_id: &str) -> Result<(), UploadError> {
        self.storage.remove(&self.key(file_id)).await
    }

    /// Drop expired or malformed payloads of this store
    pub async fn cleanup(&self) -> Result<usize, UploadError> {
        let prefix = self.prefix();
        let now = Utc::now().timestamp_millis();
        let mut removed = 0;

        for (key, raw) in self.storage.find_all().await? {
            if !key.starts_with(&prefix) {
                continue;
            }
            let expired = split_expiry(&raw).is_none_or(|(expires, _)| expires <= now);
            if expired {
                self.storage.remove(&key).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(store = %self.name, removed, "Removed expired file payloads");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_put_get_list_delete() {
        let storage = Arc::new(MemoryStorage::new());
        let blobs = BlobStore::new(storage.clone(), "uppy", Duration::from_secs(60));

        blobs.put("f1", Bytes::from_static(b"hello")).await.unwrap();
        blobs.put("f2", Bytes::from_static(b"")).await.unwrap();
        storage
            .add("other!f3", Bytes::from_static(b"12345678x"))
            .await
            .unwrap();

        assert_eq!(
            blobs.get("f1").await.unwrap(),
            Some(Bytes::from_static(b"hello"))
        );
        let listed = blobs.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed["f2"], Bytes::new());

        blobs.delete("f1").await.unwrap();
        assert!(blobs.get("f1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_blobs() {
        let storage = Arc::new(MemoryStorage::new());
        let blobs = BlobStore::new(storage.clone(), "uppy", Duration::ZERO);
        blobs.put("f1", Bytes::from_static(b"data")).await.unwrap();
        storage
            .add("uppy!broken", Bytes::from_static(b"abc"))
            .await
            .unwrap();

        assert!(blobs.list().await.unwrap().is_empty());
        assert_eq!(blobs.cleanup().await.unwrap(), 2);
        assert!(storage.is_empty());
    }
}
