//! TaskStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ExpiryWindow;

/// Error type for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A typed value bound to a statement placeholder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// A parameterised write: SQL with `$1..$n` placeholders plus bound values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl WriteStatement {
    /// Start a statement with no bound values
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Bind the next placeholder
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Render the statement with values inlined, for the failsafe journal
    pub fn to_literal(&self) -> String {
        super::literal::render(&self.sql, &self.params)
    }
}

/// A row of the shared task table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: i64,
    /// 0 when unclaimed, otherwise the run id that claimed it
    pub bucket_id: i32,
    pub processed: Option<i32>,
    pub next_send: Option<DateTime<Utc>>,
    pub number_of_sends: i32,
    pub date_created: DateTime<Utc>,
    /// The whole row as a JSON object, business columns included
    pub data: serde_json::Value,
}

impl TaskRow {
    /// An unclaimed row created now, eligible immediately
    pub fn new(id: i64, processed: Option<i32>) -> Self {
        Self {
            id,
            bucket_id: 0,
            processed,
            next_send: None,
            number_of_sends: 0,
            date_created: Utc::now(),
            data: serde_json::Value::Null,
        }
    }

    /// Attach the business payload
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Row selection rules for one allocation
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationFilter {
    /// Maximum rows claimed
    pub bucket_size: u32,
    pub unprocessed_status: i32,
    /// Also claim rows whose `processed` is NULL
    pub include_null_processed: bool,
    pub expiry: ExpiryWindow,
    /// Rows at or above this send count are excluded
    pub max_send_retries: u32,
}

/// Persistence boundary for the shared task table
///
/// Implementations acquire a connection per call and release it on every
/// exit path; no call holds a connection across an await in the caller.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Atomically claim eligible rows for `run_id`; returns rows claimed
    async fn allocate(&self, run_id: i32, filter: &AllocationFilter) -> Result<u64, StoreError>;

    /// Release rows of `run_id` still at the unprocessed status
    async fn reset_claim(&self, run_id: i32, unprocessed_status: i32) -> Result<u64, StoreError>;

    /// Release every claim at or above `min_run_id` that never finished
    async fn reset_stale_claims(
        &self,
        min_run_id: i32,
        unprocessed_status: i32,
    ) -> Result<u64, StoreError>;

    /// Load the rows claimed by `run_id` that are still unprocessed, ordered by id
    ///
    /// Finished rows keep their run id, so without the status filter a reused
    /// run id would hand them out again.
    async fn claimed_rows(
        &self,
        run_id: i32,
        unprocessed_status: i32,
        include_null_processed: bool,
    ) -> Result<Vec<TaskRow>, StoreError>;

    /// Execute a parameterised write; returns rows affected
    async fn execute(&self, statement: &WriteStatement) -> Result<u64, StoreError>;

    /// Execute a literal statement recovered from the journal
    async fn execute_literal(&self, sql: &str) -> Result<u64, StoreError>;
}
