//! Bucket allocation over the shared task table
//!
//! A bucket is the set of rows one allocation tags with a run id. The run id
//! is a small bounded counter, so tags are reused; a claim left behind by a
//! crash is released by [`BucketAllocator::reset_stale_claims`] before the
//! counter can come around to it again.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{DaemonConfig, ExpiryWindow};
use crate::store::{AllocationFilter, StoreError, TaskRow, TaskStore, WriteStatement};

/// Issues claim, reset and sweep statements for one task table
#[derive(Clone)]
pub struct BucketAllocator {
    store: Arc<dyn TaskStore>,
    bucket_size: u32,
    unprocessed_status: i32,
    min_run_id: i32,
    expiry: ExpiryWindow,
    max_send_retries: u32,
}

impl BucketAllocator {
    pub fn new(store: Arc<dyn TaskStore>, config: &DaemonConfig) -> Self {
        Self {
            store,
            bucket_size: config.bucket_size,
            unprocessed_status: config.unprocessed_status,
            min_run_id: config.min_run_id,
            expiry: config.expiry,
            max_send_retries: config.max_send_retries,
        }
    }

    /// Claim up to `bucket_size` eligible rows for `run_id`
    ///
    /// Zero rows claimed is a normal outcome.
    pub async fn allocate(
        &self,
        run_id: i32,
        include_null_processed: bool,
    ) -> Result<u64, StoreError> {
        let filter = AllocationFilter {
            bucket_size: self.bucket_size,
            unprocessed_status: self.unprocessed_status,
            include_null_processed,
            expiry: self.expiry,
            max_send_retries: self.max_send_retries,
        };
        let claimed = self.store.allocate(run_id, &filter).await?;
        debug!(run_id, claimed, "Allocated bucket");
        Ok(claimed)
    }

    /// Release rows of `run_id` that are still unprocessed
    pub async fn reset_claim(&self, run_id: i32) -> Result<u64, StoreError> {
        let reset = self
            .store
            .reset_claim(run_id, self.unprocessed_status)
            .await?;
        debug!(run_id, reset, "Reset bucket");
        Ok(reset)
    }

    /// Release every unfinished claim left by earlier runs
    pub async fn reset_stale_claims(&self) -> Result<u64, StoreError> {
        let reset = self
            .store
            .reset_stale_claims(self.min_run_id, self.unprocessed_status)
            .await?;
        info!(reset, "Released stale claims");
        Ok(reset)
    }

    /// Claim rows with a caller-supplied statement
    ///
    /// For tables whose eligibility rules differ from the standard filter.
    /// The statement must tag the rows it claims with the run id; a failure
    /// is returned, never journaled.
    pub async fn allocate_with(&self, statement: &WriteStatement) -> Result<u64, StoreError> {
        let claimed = self.store.execute(statement).await?;
        debug!(claimed, "Allocated bucket with custom statement");
        Ok(claimed)
    }

    /// Unprocessed rows claimed by `run_id`, ordered by id
    pub async fn claimed_rows(
        &self,
        run_id: i32,
        include_null_processed: bool,
    ) -> Result<Vec<TaskRow>, StoreError> {
        self.store
            .claimed_rows(run_id, self.unprocessed_status, include_null_processed)
            .await
    }
}

/// Bounded run-id sequence in `[min, max]`
///
/// ```
/// use bucketd_daemon::allocator::RunIdCounter;
///
/// let mut ids = RunIdCounter::new(1, 1, 5);
/// let seq: Vec<i32> = (0..6).map(|_| ids.next_id()).collect();
/// assert_eq!(seq, vec![2, 3, 4, 5, 1, 2]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdCounter {
    current: i32,
    min: i32,
    max: i32,
}

impl RunIdCounter {
    pub fn new(startup: i32, min: i32, max: i32) -> Self {
        Self {
            current: startup,
            min,
            max,
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(config.startup_run_id, config.min_run_id, config.max_run_id)
    }

    /// Advance and return the new id
    ///
    /// Past `max` the counter restarts at `min` rather than at `min + 1`.
    pub fn next_id(&mut self) -> i32 {
        self.current = match self.current.checked_add(1) {
            Some(next) if next <= self.max => next,
            _ => self.min,
        };
        self.current
    }

    /// Last id handed out (or the startup value)
    pub fn current(&self) -> i32 {
        self.current
    }

    /// Restart the sequence at `min`
    pub fn clamp_to_min(&mut self) {
        self.current = self.min;
    }
}
