use super::StorageAdapter;
use crate::error::UploadError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at INTEGER NOT NULL
)";

/// SQLite-backed storage. Queries run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish_non_exhaustive()
    }
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute(SCHEMA, [])?;
        info!(path = %path.display(), "Storage database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, UploadError> {
        let conn = Connection::open_in_memory()?;
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_connection<F, T>(&self, f: F) -> Result<T, UploadError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&conn).map_err(UploadError::from)
        })
        .await?
    }
}

#[async_trait]
impl StorageAdapter for SqliteStorage {
    async fn find_all(&self) -> Result<Vec<(String, Bytes)>, UploadError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM kv_store")?;
            let rows = stmt.query_map([], |row| {
                let key: String = row.get(0)?;
                let value: Vec<u8> = row.get(1)?;
                Ok((key, Bytes::from(value)))
            })?;
            let entries = rows.collect::<Result<Vec<_>, _>>();
            entries
        })
        .await
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Bytes>, UploadError> {
        let key = key.to_string();
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT value FROM kv_store WHERE key = ?",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map(|value| value.map(Bytes::from))
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), UploadError> {
        let key = key.to_string();
        self.with_connection(move |conn| {
            conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])
                .map(|_| ())
        })
        .await
    }

    async fn add(&self, key: &str, value: Bytes) -> Result<(), UploadError> {
        let key = key.to_string();
        let now = Utc::now().timestamp_millis();
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, &value[..], now],
            )
            .map(|_| ())
        })
        .await
    }
}
