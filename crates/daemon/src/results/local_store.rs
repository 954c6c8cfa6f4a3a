//! SQLite store for buffered results
//!
//! The database file is disposable: if it is missing when a batch is written,
//! it is recreated along with its schema.

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::buffer::ResultEntry;

const CREATE_REQUESTS: &str = r#"
CREATE TABLE IF NOT EXISTS requests (
    request_id            INTEGER PRIMARY KEY AUTOINCREMENT,
    client_transaction_id INTEGER,
    payload               TEXT,
    result_data           TEXT,
    result_status         INTEGER,
    number_of_sends       INTEGER NOT NULL DEFAULT 0,
    processed             INTEGER NOT NULL DEFAULT 0,
    processed_status      INTEGER,
    inserted_by           TEXT,
    date_created          DATETIME,
    updated_by            TEXT,
    date_modified         DATETIME DEFAULT CURRENT_TIMESTAMP,
    UNIQUE (client_transaction_id, inserted_by)
)
"#;

const UPSERT_REQUEST: &str = r#"
INSERT INTO requests (payload, result_status, result_data, inserted_by, client_transaction_id, date_created)
VALUES (?, ?, ?, ?, ?, datetime('now'))
ON CONFLICT (client_transaction_id, inserted_by) DO UPDATE SET
    payload = excluded.payload,
    result_status = excluded.result_status,
    result_data = excluded.result_data,
    date_modified = CURRENT_TIMESTAMP
"#;

/// Result store errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResultStoreError {
    /// The database file or schema could not be created
    #[error("failed to provision result store: {0}")]
    Provision(String),

    /// Database error
    #[error("result store error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Local SQLite `requests` table
pub struct LocalResultStore {
    path: PathBuf,
    pool: Mutex<Option<SqlitePool>>,
}

impl LocalResultStore {
    /// Create a store; nothing is opened until the first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist entries, returning how many were stored
    ///
    /// An entry that fails is retried once against a freshly provisioned
    /// database; if that fails too the entry is dropped.
    pub async fn write(&self, entries: &[ResultEntry]) -> usize {
        let mut stored = 0;
        for entry in entries {
            match self.upsert(entry).await {
                Ok(()) => stored += 1,
                Err(first) => {
                    warn!(
                        transaction_id = entry.client_transaction_id,
                        "Result write failed, reprovisioning: {}", first
                    );
                    self.invalidate().await;
                    match self.upsert(entry).await {
                        Ok(()) => stored += 1,
                        Err(e) => error!(
                            transaction_id = entry.client_transaction_id,
                            "Dropping result after retry: {}", e
                        ),
                    }
                }
            }
        }
        stored
    }

    /// Number of rows in `requests`
    pub async fn count(&self) -> Result<i64, ResultStoreError> {
        let pool = self.pool().await?;
        sqlx::query_scalar("SELECT COUNT(*) FROM requests")
            .fetch_one(&pool)
            .await
            .map_err(|e| ResultStoreError::Database(e.to_string()))
    }

    /// Close the connection pool, if open
    pub async fn close(&self) {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.close().await;
        }
    }

    async fn upsert(&self, entry: &ResultEntry) -> Result<(), ResultStoreError> {
        let payload = serde_json::to_string(&entry.parameters)
            .map_err(|e| ResultStoreError::Serialization(e.to_string()))?;
        let pool = self.pool().await?;

        sqlx::query(UPSERT_REQUEST)
            .bind(payload)
            .bind(entry.result_status)
            .bind(&entry.result_data)
            .bind(&entry.inserted_by)
            .bind(entry.client_transaction_id)
            .execute(&pool)
            .await
            .map_err(|e| ResultStoreError::Database(e.to_string()))?;

        debug!(transaction_id = entry.client_transaction_id, "Stored result");
        Ok(())
    }

    /// Open pool, provisioning it when absent or when the file has vanished
    async fn pool(&self) -> Result<SqlitePool, ResultStoreError> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            if self.path.exists() {
                return Ok(pool.clone());
            }
            warn!(path = %self.path.display(), "Result database missing, recreating");
            pool.close().await;
        }

        let pool = self.provision().await?;
        *guard = Some(pool.clone());
        Ok(pool)
    }

    async fn invalidate(&self) {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.close().await;
        }
    }

    async fn provision(&self) -> Result<SqlitePool, ResultStoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ResultStoreError::Provision(e.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| ResultStoreError::Provision(e.to_string()))?;

        sqlx::query(CREATE_REQUESTS)
            .execute(&pool)
            .await
            .map_err(|e| ResultStoreError::Provision(e.to_string()))?;

        info!(path = %self.path.display(), "Provisioned result database");
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use crate::results::{flush_once, ResultBuffer};

    fn entry(transaction_id: i64, status: i32) -> ResultEntry {
        ResultEntry {
            parameters: json!({ "id": transaction_id }),
            result_status: status,
            result_data: format!("status {status}"),
            inserted_by: "svc".to_string(),
            client_transaction_id: transaction_id,
        }
    }

    #[tokio::test]
    async fn test_write_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalResultStore::new(dir.path().join("sqlite").join("results.db"));

        let stored = store.write(&[entry(1, 200), entry(2, 200), entry(3, 500)]).await;
        assert_eq!(stored, 3);
        assert!(store.path().exists());
        assert_eq!(store.count().await.unwrap(), 3);
        store.close().await;
    }

    #[tokio::test]
    async fn test_same_transaction_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalResultStore::new(dir.path().join("results.db"));

        store.write(&[entry(7, 500)]).await;
        store.write(&[entry(7, 200)]).await;
        assert_eq!(store.count().await.unwrap(), 1);

        let pool = store.pool().await.unwrap();
        let status: i32 = sqlx::query_scalar("SELECT result_status FROM requests")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, 200);
        store.close().await;
    }

    #[tokio::test]
    async fn test_recreates_deleted_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.db");
        let store = LocalResultStore::new(path.clone());

        assert_eq!(store.write(&[entry(1, 200)]).await, 1);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(store.write(&[entry(2, 200)]).await, 1);
        assert!(path.exists());
        assert_eq!(store.count().await.unwrap(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn test_buffer_empty_while_write_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalResultStore::new(dir.path().join("results.db")));
        let buffer = Arc::new(ResultBuffer::new("svc"));
        for n in 1..=3 {
            buffer.record(json!({ "n": n }), 200, "ok", n);
        }

        // Holding the pool slot parks the write before any I/O
        let held = store.pool.lock().await;
        let flush = tokio::spawn({
            let buffer = Arc::clone(&buffer);
            let store = Arc::clone(&store);
            async move { flush_once(&buffer, &store).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(buffer.is_empty());
        assert!(!flush.is_finished());
        buffer.record(json!({ "n": 4 }), 200, "ok", 4);
        assert_eq!(buffer.len(), 1);

        drop(held);
        assert_eq!(flush.await.unwrap(), 3);
        assert_eq!(store.count().await.unwrap(), 3);
        store.close().await;
    }
}
