//! Key/value persistence used by the recovery plugin.

// Module declarations
mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::UploadError;
use async_trait::async_trait;
use bytes::Bytes;

/// Async key/value store. Keys are plain strings; values are opaque bytes.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Every entry, in no particular order
    async fn find_all(&self) -> Result<Vec<(String, Bytes)>, UploadError>;

    async fn find_by_key(&self, key: &str) -> Result<Option<Bytes>, UploadError>;

    /// Missing keys are not an error
    async fn remove(&self, key: &str) -> Result<(), UploadError>;

    /// Insert or overwrite
    async fn add(&self, key: &str, value: Bytes) -> Result<(), UploadError>;
}
