//! In-memory implementation of TaskStore for testing

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::store::*;

/// In-memory implementation of TaskStore
///
/// Rows live in a map guarded by one lock, so every allocation is atomic with
/// respect to every other, the same guarantee the SQL store gets from row
/// locking. Writes cannot be interpreted without a SQL engine; they are
/// recorded in literal form so tests can assert on them.
///
/// # Example
///
/// ```
/// use bucketd_daemon::store::{InMemoryTaskStore, TaskRow};
///
/// let store = InMemoryTaskStore::new();
/// store.insert(TaskRow::new(1, Some(0)));
/// assert_eq!(store.row_count(), 1);
/// ```
#[derive(Default)]
pub struct InMemoryTaskStore {
    rows: RwLock<BTreeMap<i64, TaskRow>>,
    executed: RwLock<Vec<String>>,
    fail_writes: AtomicBool,
    fail_loads: AtomicBool,
    unavailable: AtomicBool,
}

impl InMemoryTaskStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a row
    pub fn insert(&self, row: TaskRow) {
        self.rows.write().insert(row.id, row);
    }

    /// Get a copy of a row
    pub fn row(&self, id: i64) -> Option<TaskRow> {
        self.rows.read().get(&id).cloned()
    }

    /// Number of rows held
    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    /// Set a row's processed status
    pub fn set_processed(&self, id: i64, status: Option<i32>) {
        if let Some(row) = self.rows.write().get_mut(&id) {
            row.processed = status;
        }
    }

    /// Statements executed successfully, in literal form, oldest first
    pub fn executed(&self) -> Vec<String> {
        self.executed.read().clone()
    }

    /// Make every write fail until cleared
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make bucket loads fail until cleared
    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make every operation fail until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }

    fn record_write(&self, sql: String) -> Result<u64, StoreError> {
        self.check_available()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database(format!("write rejected: {sql}")));
        }
        self.executed.write().push(sql);
        Ok(1)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn allocate(&self, run_id: i32, filter: &AllocationFilter) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = Utc::now();
        let max_age = filter.expiry.as_chrono();
        let mut rows = self.rows.write();

        let eligible = rows
            .values_mut()
            .filter(|row| row.bucket_id == 0)
            .filter(|row| row.next_send.map_or(true, |at| at < now))
            .filter(|row| match row.processed {
                Some(status) => status == filter.unprocessed_status,
                None => filter.include_null_processed,
            })
            .filter(|row| now - row.date_created < max_age)
            .filter(|row| i64::from(row.number_of_sends) < i64::from(filter.max_send_retries))
            .take(filter.bucket_size as usize);

        let mut claimed = 0;
        for row in eligible {
            row.bucket_id = run_id;
            claimed += 1;
        }
        Ok(claimed)
    }

    async fn reset_claim(&self, run_id: i32, unprocessed_status: i32) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut reset = 0;
        for row in self.rows.write().values_mut() {
            if row.bucket_id == run_id && row.processed == Some(unprocessed_status) {
                row.bucket_id = 0;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn reset_stale_claims(
        &self,
        min_run_id: i32,
        unprocessed_status: i32,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut reset = 0;
        for row in self.rows.write().values_mut() {
            let unfinished = row.processed.map_or(true, |s| s == unprocessed_status);
            if row.bucket_id >= min_run_id && unfinished {
                row.bucket_id = 0;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn claimed_rows(
        &self,
        run_id: i32,
        unprocessed_status: i32,
        include_null_processed: bool,
    ) -> Result<Vec<TaskRow>, StoreError> {
        self.check_available()?;
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Database("bucket load rejected".into()));
        }
        Ok(self
            .rows
            .read()
            .values()
            .filter(|row| row.bucket_id == run_id)
            .filter(|row| match row.processed {
                Some(status) => status == unprocessed_status,
                None => include_null_processed,
            })
            .cloned()
            .collect())
    }

    async fn execute(&self, statement: &WriteStatement) -> Result<u64, StoreError> {
        self.record_write(statement.to_literal())
    }

    async fn execute_literal(&self, sql: &str) -> Result<u64, StoreError> {
        self.record_write(sql.to_string())
    }
}
