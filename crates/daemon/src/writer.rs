//! Hot-path writes with failsafe journaling
//!
//! Tasks never see an error from [`RecordWriter::execute`]. A statement the
//! store rejects is rendered to literal SQL and appended to the journal, and
//! the next work cycle replays it.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::config::{DaemonConfig, ResendSchedule};
use crate::journal::FailsafeJournal;
use crate::store::{StoreError, TaskRow, TaskStore, WriteStatement};

/// What happened to a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Executed against the store, with rows affected
    Applied(u64),
    /// Rejected by the store and saved for replay
    Journaled,
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Writes rows of the task table on behalf of pool tasks
#[derive(Clone)]
pub struct RecordWriter {
    store: Arc<dyn TaskStore>,
    journal: Arc<FailsafeJournal>,
    table: String,
    resend: ResendSchedule,
}

impl RecordWriter {
    pub fn new(
        store: Arc<dyn TaskStore>,
        journal: Arc<FailsafeJournal>,
        config: &DaemonConfig,
    ) -> Self {
        Self {
            store,
            journal,
            table: config.table.clone(),
            resend: config.resend,
        }
    }

    /// Execute `statement`, journaling it if the store rejects it
    pub async fn execute(&self, statement: WriteStatement) -> WriteOutcome {
        match self.store.execute(&statement).await {
            Ok(rows) => WriteOutcome::Applied(rows),
            Err(e) => {
                let literal = statement.to_literal();
                warn!(statement = %literal, "Write failed, journaling: {}", e);
                self.journal.append(&literal).await;
                WriteOutcome::Journaled
            }
        }
    }

    /// Execute `statement` without the journal fallback
    ///
    /// For writes that are worthless when late, such as status probes or
    /// lease renewals; the caller decides what a failure means.
    pub async fn execute_unjournaled(&self, statement: &WriteStatement) -> Result<u64, StoreError> {
        self.store.execute(statement).await
    }

    /// Set a row's final status
    pub async fn mark_processed(&self, row_id: i64, status: i32) -> WriteOutcome {
        let statement = WriteStatement::new(format!(
            "UPDATE {} SET processed = $1 WHERE id = $2",
            self.table
        ))
        .bind(status)
        .bind(row_id);
        self.execute(statement).await
    }

    /// Record a failed attempt and release the row for a later send
    ///
    /// Bumps `number_of_sends`, clears the claim and pushes `next_send` out
    /// according to the resend schedule.
    pub async fn reschedule(&self, row: &TaskRow, status: i32) -> WriteOutcome {
        let sends = row.number_of_sends.saturating_add(1);
        let next_send = Utc::now() + self.resend.delay_for(sends);
        let statement = WriteStatement::new(format!(
            "UPDATE {} SET processed = $1, number_of_sends = $2, bucket_id = 0, next_send = $3 WHERE id = $4",
            self.table
        ))
        .bind(status)
        .bind(sends)
        .bind(next_send)
        .bind(row.id);
        self.execute(statement).await
    }

    pub fn journal(&self) -> &Arc<FailsafeJournal> {
        &self.journal
    }
}
