//! PostgreSQL implementation of TaskStore
//!
//! Production persistence for the shared task table:
//! - Claiming through a `FOR UPDATE SKIP LOCKED` subselect, so concurrent
//!   allocators never see the same row
//! - All dynamic values bound as parameters; only the table name is
//!   formatted in, and it is validated as a plain identifier at startup

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, error, instrument};

use super::literal::inline_nulls;
use super::store::*;

/// PostgreSQL implementation of TaskStore
///
/// Expected table shape (business columns may be added freely):
///
/// ```sql
/// CREATE TABLE daemon_tasks (
///     id              BIGSERIAL PRIMARY KEY,
///     bucket_id       INTEGER NOT NULL DEFAULT 0,
///     processed       INTEGER,
///     next_send       TIMESTAMPTZ,
///     number_of_sends INTEGER NOT NULL DEFAULT 0,
///     date_created    TIMESTAMPTZ NOT NULL DEFAULT NOW()
/// );
/// ```
///
/// # Example
///
/// ```ignore
/// use bucketd_daemon::store::PostgresTaskStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresTaskStore::new(pool, "daemon_tasks");
/// ```
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
    table: String,
}

impl PostgresTaskStore {
    /// Create a store over `table` using the given connection pool
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The task table name
    pub fn table(&self) -> &str {
        &self.table
    }
}

fn db_error(context: &str, e: sqlx::Error) -> StoreError {
    error!("{}: {}", context, e);
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(e.to_string())
        }
        other => StoreError::Database(other.to_string()),
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        // Inlined by `inline_nulls` before binding
        SqlValue::Null => query.bind(None::<i64>),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Timestamp(v) => query.bind(*v),
    }
}

fn task_row(row: &PgRow) -> Result<TaskRow, StoreError> {
    let get = |e: sqlx::Error| StoreError::Serialization(e.to_string());
    Ok(TaskRow {
        id: row.try_get("id").map_err(get)?,
        bucket_id: row.try_get("bucket_id").map_err(get)?,
        processed: row.try_get("processed").map_err(get)?,
        next_send: row.try_get("next_send").map_err(get)?,
        number_of_sends: row.try_get("number_of_sends").map_err(get)?,
        date_created: row.try_get("date_created").map_err(get)?,
        data: row.try_get("data").map_err(get)?,
    })
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, filter), fields(table = %self.table))]
    async fn allocate(&self, run_id: i32, filter: &AllocationFilter) -> Result<u64, StoreError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET bucket_id = $1
            WHERE id IN (
                SELECT id
                FROM {table}
                WHERE (next_send < NOW() OR next_send IS NULL)
                  AND bucket_id = 0
                  AND (processed = $2 OR ($3 AND processed IS NULL))
                  AND date_created > NOW() - make_interval(mins => $4)
                  AND number_of_sends < $5
                ORDER BY id
                LIMIT $6
                FOR UPDATE SKIP LOCKED
            )
            AND bucket_id = 0
            "#,
            table = self.table
        );

        let result = sqlx::query(&sql)
            .bind(run_id)
            .bind(filter.unprocessed_status)
            .bind(filter.include_null_processed)
            .bind(i32::try_from(filter.expiry.total_minutes()).unwrap_or(i32::MAX))
            .bind(i32::try_from(filter.max_send_retries).unwrap_or(i32::MAX))
            .bind(i64::from(filter.bucket_size))
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to allocate bucket", e))?;

        let claimed = result.rows_affected();
        if claimed > 0 {
            debug!(run_id, claimed, "allocated bucket");
        }
        Ok(claimed)
    }

    #[instrument(skip(self), fields(table = %self.table))]
    async fn reset_claim(&self, run_id: i32, unprocessed_status: i32) -> Result<u64, StoreError> {
        let sql = format!(
            "UPDATE {} SET bucket_id = 0 WHERE bucket_id = $1 AND processed = $2",
            self.table
        );

        let result = sqlx::query(&sql)
            .bind(run_id)
            .bind(unprocessed_status)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to reset bucket", e))?;

        debug!(run_id, reset = result.rows_affected(), "reset bucket");
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(table = %self.table))]
    async fn reset_stale_claims(
        &self,
        min_run_id: i32,
        unprocessed_status: i32,
    ) -> Result<u64, StoreError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET bucket_id = 0
            WHERE bucket_id >= $1
              AND (processed = $2 OR processed IS NULL)
            "#,
            self.table
        );

        let result = sqlx::query(&sql)
            .bind(min_run_id)
            .bind(unprocessed_status)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to reset stale claims", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(table = %self.table))]
    async fn claimed_rows(
        &self,
        run_id: i32,
        unprocessed_status: i32,
        include_null_processed: bool,
    ) -> Result<Vec<TaskRow>, StoreError> {
        let sql = format!(
            r#"
            SELECT id, bucket_id, processed, next_send, number_of_sends, date_created,
                   to_jsonb(t) AS data
            FROM {} t
            WHERE bucket_id = $1
              AND (processed = $2 OR ($3 AND processed IS NULL))
            ORDER BY id
            "#,
            self.table
        );

        let rows = sqlx::query(&sql)
            .bind(run_id)
            .bind(unprocessed_status)
            .bind(include_null_processed)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to load bucket", e))?;

        rows.iter().map(task_row).collect()
    }

    #[instrument(skip(self, statement))]
    async fn execute(&self, statement: &WriteStatement) -> Result<u64, StoreError> {
        let (sql, params) = inline_nulls(&statement.sql, &statement.params);
        let query = params.iter().fold(sqlx::query(&sql), bind_value);

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to execute write", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn execute_literal(&self, sql: &str) -> Result<u64, StoreError> {
        let result = sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to execute journaled statement", e))?;

        Ok(result.rows_affected())
    }
}
