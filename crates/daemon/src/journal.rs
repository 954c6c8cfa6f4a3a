//! Failsafe journal for write statements
//!
//! When a hot-path write fails, its fully rendered SQL is appended here as a
//! single line. Before every work cycle the controller drains the file and
//! replays each statement against the store. Delivery is at-least-once: a
//! statement may be replayed after it already took effect.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::reliability::ReplayPolicy;
use crate::store::TaskStore;

/// Outcome of one drain-and-replay pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Statements that executed successfully
    pub applied: usize,
    /// Mutations that exhausted their attempts and went back to the journal
    pub rejournaled: usize,
    /// Non-mutations that failed; these are not retried or kept
    pub dropped: usize,
}

impl ReplayReport {
    pub fn total(&self) -> usize {
        self.applied + self.rejournaled + self.dropped
    }
}

/// Append-only file of statements awaiting replay
///
/// All file access goes through one async mutex, so worker appends never
/// interleave with a drain.
#[derive(Debug)]
pub struct FailsafeJournal {
    path: PathBuf,
    io_lock: Mutex<()>,
}

impl FailsafeJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one statement
    ///
    /// Newlines are flattened to spaces so the statement stays on one line.
    /// Failures are logged and swallowed; the caller has nowhere better to
    /// put the statement.
    pub async fn append(&self, statement: &str) {
        let line = flatten(statement);
        if line.trim().is_empty() {
            return;
        }

        let _guard = self.io_lock.lock().await;
        if let Err(e) = self.append_line(&line).await {
            error!(
                path = %self.path.display(),
                statement = %line,
                "Failed to journal statement: {}",
                e
            );
        }
    }

    async fn append_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{line}\n").as_bytes()).await?;
        file.flush().await
    }

    /// Read every pending statement and empty the file
    ///
    /// Blank lines are skipped and duplicates collapse to their first
    /// occurrence. A missing file means nothing is pending.
    pub async fn drain(&self) -> std::io::Result<Vec<String>> {
        let _guard = self.io_lock.lock().await;

        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut seen = HashSet::new();
        let statements: Vec<String> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| seen.insert(*line))
            .map(str::to_string)
            .collect();

        fs::write(&self.path, b"").await?;
        Ok(statements)
    }

    /// Drain the journal and replay each statement in order
    ///
    /// Mutations are attempted up to `policy.max_attempts` times with a fixed
    /// pause; one that still fails is appended back. Anything else is run
    /// once.
    pub async fn drain_and_replay(
        &self,
        store: &dyn TaskStore,
        policy: &ReplayPolicy,
    ) -> ReplayReport {
        let statements = match self.drain().await {
            Ok(statements) => statements,
            Err(e) => {
                error!(path = %self.path.display(), "Failed to read journal: {}", e);
                return ReplayReport::default();
            }
        };

        let mut report = ReplayReport::default();
        if statements.is_empty() {
            return report;
        }
        info!(pending = statements.len(), "Replaying journaled statements");

        for statement in statements {
            if !is_mutation(&statement) {
                match store.execute_literal(&statement).await {
                    Ok(_) => report.applied += 1,
                    Err(e) => {
                        warn!(statement = %statement, "Dropping failed journaled statement: {}", e);
                        report.dropped += 1;
                    }
                }
                continue;
            }

            if replay_mutation(store, policy, &statement).await {
                report.applied += 1;
            } else {
                self.append(&statement).await;
                report.rejournaled += 1;
            }
        }

        info!(
            applied = report.applied,
            rejournaled = report.rejournaled,
            dropped = report.dropped,
            "Journal replay finished"
        );
        report
    }
}

async fn replay_mutation(store: &dyn TaskStore, policy: &ReplayPolicy, statement: &str) -> bool {
    let mut attempt = 1;
    loop {
        match store.execute_literal(statement).await {
            Ok(rows) => {
                debug!(attempt, rows, "Replayed statement");
                return true;
            }
            Err(e) if policy.has_attempts_remaining(attempt) => {
                debug!(attempt, "Replay attempt failed: {}", e);
                attempt += 1;
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
            Err(e) => {
                warn!(attempt, statement = %statement, "Replay failed, keeping in journal: {}", e);
                return false;
            }
        }
    }
}

fn flatten(statement: &str) -> String {
    statement.replace(['\r', '\n'], " ")
}

/// `UPDATE`, `INSERT` and `DELETE` statements, case-insensitive
fn is_mutation(statement: &str) -> bool {
    let verb = statement
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(verb.as_str(), "UPDATE" | "INSERT" | "DELETE")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    use crate::store::{
        AllocationFilter, InMemoryTaskStore, StoreError, TaskRow, WriteStatement,
    };

    /// Fails the first `failures` executions, then succeeds
    #[derive(Default)]
    struct FlakyStore {
        failures: usize,
        attempts: AtomicUsize,
        applied: SyncMutex<Vec<String>>,
    }

    impl FlakyStore {
        fn failing(failures: usize) -> Self {
            Self {
                failures,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl TaskStore for FlakyStore {
        async fn allocate(&self, _: i32, _: &AllocationFilter) -> Result<u64, StoreError> {
            Ok(0)
        }

        async fn reset_claim(&self, _: i32, _: i32) -> Result<u64, StoreError> {
            Ok(0)
        }

        async fn reset_stale_claims(&self, _: i32, _: i32) -> Result<u64, StoreError> {
            Ok(0)
        }

        async fn claimed_rows(&self, _: i32, _: i32, _: bool) -> Result<Vec<TaskRow>, StoreError> {
            Ok(Vec::new())
        }

        async fn execute(&self, statement: &WriteStatement) -> Result<u64, StoreError> {
            self.execute_literal(&statement.to_literal()).await
        }

        async fn execute_literal(&self, sql: &str) -> Result<u64, StoreError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(StoreError::Unavailable("flaky".into()));
            }
            self.applied.lock().push(sql.to_string());
            Ok(1)
        }
    }

    fn journal_in(dir: &tempfile::TempDir) -> FailsafeJournal {
        FailsafeJournal::new(dir.path().join("journal").join("FAILED_QUERIES.TXT"))
    }

    fn quick(attempts: u32) -> ReplayPolicy {
        ReplayPolicy::fixed(Duration::from_millis(1), attempts)
    }

    #[test]
    fn test_is_mutation() {
        assert!(is_mutation("UPDATE t SET x = 1"));
        assert!(is_mutation("  insert into t values (1)"));
        assert!(is_mutation("Delete FROM t"));
        assert!(!is_mutation("SELECT 1"));
        assert!(!is_mutation("UPDATED"));
        assert!(!is_mutation(""));
    }

    #[tokio::test]
    async fn test_drain_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(&dir);
        assert!(journal.drain().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_flattens_newlines() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(&dir);

        journal.append("UPDATE t\nSET x = 1\r\nWHERE id = 2").await;
        journal.append("   ").await;

        assert_eq!(
            journal.drain().await.unwrap(),
            vec!["UPDATE t SET x = 1  WHERE id = 2"]
        );
    }

    #[tokio::test]
    async fn test_replay_in_order_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(&dir);
        journal.append("UPDATE t SET x = 1 WHERE id = 1").await;
        journal.append("UPDATE t SET x = 2 WHERE id = 2").await;

        let store = InMemoryTaskStore::new();
        let report = journal.drain_and_replay(&store, &quick(3)).await;

        assert_eq!(report.applied, 2);
        assert_eq!(
            store.executed(),
            vec![
                "UPDATE t SET x = 1 WHERE id = 1",
                "UPDATE t SET x = 2 WHERE id = 2"
            ]
        );
        let contents = std::fs::read_to_string(journal.path()).unwrap();
        assert!(contents.is_empty());
    }

    #[tokio::test]
    async fn test_duplicates_replay_once() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(&dir);
        for _ in 0..3 {
            journal.append("UPDATE t SET x = 1 WHERE id = 1").await;
        }

        let store = InMemoryTaskStore::new();
        let report = journal.drain_and_replay(&store, &quick(3)).await;

        assert_eq!(report.total(), 1);
        assert_eq!(store.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(&dir);
        journal.append("UPDATE t SET x = 1").await;

        let store = FlakyStore::failing(2);
        let report = journal.drain_and_replay(&store, &quick(3)).await;

        assert_eq!(report.applied, 1);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert!(journal.drain().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persistent_failure_is_rejournaled() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(&dir);
        journal.append("DELETE FROM t WHERE id = 9").await;

        let store = InMemoryTaskStore::new();
        store.fail_writes(true);
        let report = journal.drain_and_replay(&store, &quick(2)).await;

        assert_eq!(report.rejournaled, 1);
        assert_eq!(
            journal.drain().await.unwrap(),
            vec!["DELETE FROM t WHERE id = 9"]
        );
    }

    #[tokio::test]
    async fn test_non_mutation_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(&dir);
        journal.append("SELECT pg_notify('bucketd', 'done')").await;

        let store = FlakyStore::failing(1);
        let report = journal.drain_and_replay(&store, &quick(5)).await;

        assert_eq!(report.dropped, 1);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 1);
        assert!(journal.drain().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let journal = std::sync::Arc::new(journal_in(&dir));

        let mut handles = Vec::new();
        for n in 0..20 {
            let journal = journal.clone();
            handles.push(tokio::spawn(async move {
                journal.append(&format!("UPDATE t SET x = {n}")).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut lines = journal.drain().await.unwrap();
        lines.sort();
        assert_eq!(lines.len(), 20);
        assert!(lines.iter().all(|l| l.starts_with("UPDATE t SET x = ")));
    }
}
