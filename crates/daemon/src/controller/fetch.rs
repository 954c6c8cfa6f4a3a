//! Work-fetching extension points
//!
//! A [`BucketFetcher`] decides what one healthy pass does. Most daemons only
//! need to turn a row into a task; [`RowProcessor`] wrapped in
//! [`RowDispatch`] covers that case with the standard claim-load-submit flow.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::daemon::DaemonError;
use crate::allocator::{BucketAllocator, RunIdCounter};
use crate::pool::{BackpressureGate, PoolError, PoolTask, WorkerPool};
use crate::results::ResultBuffer;
use crate::store::{TaskRow, WriteStatement};
use crate::writer::RecordWriter;

/// One healthy pass of work fetching
#[async_trait]
pub trait BucketFetcher: Send + Sync {
    async fn fetch_bucket(&self, ctx: &mut FetchContext<'_>) -> Result<(), DaemonError>;
}

/// Turns claimed rows into pool tasks
///
/// # Example
///
/// ```ignore
/// struct Notify;
///
/// impl RowProcessor for Notify {
///     fn build_task(&self, row: TaskRow, handles: TaskHandles) -> PoolTask {
///         Box::pin(async move {
///             send(&row.data).await;
///             handles.writer.mark_processed(row.id, 1).await;
///         })
///     }
/// }
///
/// let daemon = Daemon::builder(config)
///     .store(store)
///     .fetcher(Arc::new(RowDispatch(Notify)))
///     .start()
///     .await?;
/// ```
pub trait RowProcessor: Send + Sync {
    /// Also claim rows whose status is NULL
    fn include_null_processed(&self) -> bool {
        false
    }

    fn build_task(&self, row: TaskRow, handles: TaskHandles) -> PoolTask;
}

/// Adapts a [`RowProcessor`] to [`BucketFetcher`]
pub struct RowDispatch<P>(pub P);

#[async_trait]
impl<P: RowProcessor> BucketFetcher for RowDispatch<P> {
    async fn fetch_bucket(&self, ctx: &mut FetchContext<'_>) -> Result<(), DaemonError> {
        let processor = &self.0;
        ctx.dispatch_bucket(processor.include_null_processed(), |row, handles| {
            processor.build_task(row, handles)
        })
        .await?;
        Ok(())
    }
}

/// What a task gets to work with
#[derive(Clone)]
pub struct TaskHandles {
    pub writer: RecordWriter,
    /// Present when the daemon was built with a result store
    pub results: Option<Arc<ResultBuffer>>,
    /// Run id the row was claimed under
    pub run_id: i32,
}

/// Outcome of [`FetchContext::dispatch_bucket`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Run id used, or `None` when backpressure skipped the pass
    pub run_id: Option<i32>,
    pub claimed: u64,
    pub submitted: usize,
}

/// Daemon resources lent to a fetcher for one pass
pub struct FetchContext<'a> {
    pub(crate) run_ids: &'a mut RunIdCounter,
    pub(crate) allocator: &'a BucketAllocator,
    pub(crate) pool: &'a WorkerPool,
    pub(crate) backpressure: &'a BackpressureGate,
    pub(crate) writer: &'a RecordWriter,
    pub(crate) results: Option<&'a Arc<ResultBuffer>>,
}

impl FetchContext<'_> {
    /// Advance the run-id counter
    pub fn next_run_id(&mut self) -> i32 {
        self.run_ids.next_id()
    }

    /// Claim a bucket under `run_id`
    pub async fn allocate(
        &self,
        run_id: i32,
        include_null_processed: bool,
    ) -> Result<u64, DaemonError> {
        Ok(self.allocator.allocate(run_id, include_null_processed).await?)
    }

    /// Claim a bucket with a caller-supplied statement
    ///
    /// The statement must set `bucket_id` to a run id from
    /// [`next_run_id`](Self::next_run_id). A rejected statement is returned
    /// as an error and never journaled.
    pub async fn allocate_with(&self, statement: &WriteStatement) -> Result<u64, DaemonError> {
        Ok(self.allocator.allocate_with(statement).await?)
    }

    /// Unprocessed rows claimed by `run_id`
    pub async fn claimed_rows(
        &self,
        run_id: i32,
        include_null_processed: bool,
    ) -> Result<Vec<TaskRow>, DaemonError> {
        Ok(self
            .allocator
            .claimed_rows(run_id, include_null_processed)
            .await?)
    }

    /// Release the unprocessed rows of `run_id`
    pub async fn reset_claim(&self, run_id: i32) -> Result<u64, DaemonError> {
        Ok(self.allocator.reset_claim(run_id).await?)
    }

    /// Queue a task on the worker pool
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pool.submit(task)
    }

    /// Whether the pool queue has room for another bucket
    pub fn is_accepting_more_work(&self) -> bool {
        self.backpressure.should_accept(self.pool.queue_depth())
    }

    pub fn queue_depth(&self) -> usize {
        self.pool.queue_depth()
    }

    pub fn writer(&self) -> &RecordWriter {
        self.writer
    }

    pub fn results(&self) -> Option<Arc<ResultBuffer>> {
        self.results.cloned()
    }

    /// Handles for tasks of one bucket
    pub fn handles(&self, run_id: i32) -> TaskHandles {
        TaskHandles {
            writer: self.writer.clone(),
            results: self.results(),
            run_id,
        }
    }

    /// Claim a bucket and submit one task per row
    ///
    /// Skips the pass when the queue is full. If the bucket cannot be loaded or
    /// the pool refuses a task, the unprocessed rows of the bucket are
    /// released and the error returned.
    pub async fn dispatch_bucket<F>(
        &mut self,
        include_null_processed: bool,
        mut build: F,
    ) -> Result<DispatchSummary, DaemonError>
    where
        F: FnMut(TaskRow, TaskHandles) -> PoolTask + Send,
    {
        if !self.is_accepting_more_work() {
            debug!(queue_depth = self.queue_depth(), "Queue full, skipping allocation");
            return Ok(DispatchSummary::default());
        }

        let run_id = self.next_run_id();
        let claimed = self.allocate(run_id, include_null_processed).await?;
        let mut summary = DispatchSummary {
            run_id: Some(run_id),
            claimed,
            submitted: 0,
        };
        if claimed == 0 {
            return Ok(summary);
        }

        let rows = match self.claimed_rows(run_id, include_null_processed).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(run_id, "Failed to load bucket, releasing it: {}", e);
                self.release(run_id).await;
                return Err(e);
            }
        };
        for row in rows {
            let task = build(row, self.handles(run_id));
            if let Err(e) = self.pool.submit(task) {
                warn!(run_id, "Pool rejected task, releasing bucket: {}", e);
                self.release(run_id).await;
                return Err(e.into());
            }
            summary.submitted += 1;
        }

        debug!(run_id, claimed, submitted = summary.submitted, "Dispatched bucket");
        Ok(summary)
    }

    /// Reset a partly dispatched bucket; the caller's error takes precedence
    async fn release(&self, run_id: i32) {
        if let Err(e) = self.reset_claim(run_id).await {
            error!(run_id, "Failed to release bucket: {}", e);
        }
    }
}
