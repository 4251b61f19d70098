use super::StorageAdapter;
use crate::error::UploadError;
use async_trait::async_trait;
use bytes::Bytes;
use indexmap::IndexMap;
use std::sync::{Mutex, MutexGuard};

/// Process-local storage, lost on exit
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<IndexMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, IndexMap<String, Bytes>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn find_all(&self) -> Result<Vec<(String, Bytes)>, UploadError> {
        Ok(self
            .guard()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Bytes>, UploadError> {
        Ok(self.guard().get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<(), UploadError> {
        self.guard().shift_remove(key);
        Ok(())
    }

    async fn add(&self, key: &str, value: Bytes) -> Result<(), UploadError> {
        self.guard().insert(key.to_string(), value);
        Ok(())
    }
}
