//! # Table-Mining Daemon Base
//!
//! Building blocks for daemons that treat a shared SQL table as a work queue.
//!
//! ## Features
//!
//! - **Atomic bucket claims**: rows are tagged with a run id by one conditional
//!   update, so concurrent daemons never process the same row
//! - **Outage handling**: the controller suspends when the store disappears
//!   and recovers claims, pending writes and workers when it returns
//! - **Failsafe journal**: rejected writes are saved as literal SQL and
//!   replayed before each pass
//! - **Result buffer**: side-channel results are batched into a local SQLite
//!   file on a timer
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Daemon                              │
//! │  (health probe, RUNNING / INTERRUPTED / RESUMING)            │
//! └─────────────────────────────────────────────────────────────┘
//!          │ replay                 │ fetch_bucket
//!          ▼                        ▼
//! ┌──────────────────┐   ┌──────────────────────────────────────┐
//! │ FailsafeJournal  │   │ BucketAllocator ──► TaskStore         │
//! │ (FAILED_QUERIES) │   │ (claim, reset, stale sweep)           │
//! └──────────────────┘   └──────────────────────────────────────┘
//!          ▲                        │ one task per row
//!          │ rejected writes        ▼
//! ┌──────────────────┐   ┌──────────────────────────────────────┐
//! │  RecordWriter    │◄──│ WorkerPool (FIFO, wake-one)           │
//! └──────────────────┘   └──────────────────────────────────────┘
//!                                   │ record
//!                                   ▼
//!                        ┌──────────────────────────────────────┐
//!                        │ ResultBuffer ──► ResultFlusher ──►    │
//!                        │                  LocalResultStore     │
//!                        └──────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use bucketd_daemon::prelude::*;
//!
//! struct Deliver;
//!
//! impl RowProcessor for Deliver {
//!     fn build_task(&self, row: TaskRow, handles: TaskHandles) -> PoolTask {
//!         Box::pin(async move {
//!             // ... do the work for `row`
//!             handles.writer.mark_processed(row.id, 1).await;
//!         })
//!     }
//! }
//!
//! let config = DaemonConfig::from_env()?;
//! let pg = sqlx::PgPool::connect(&config.database_url).await?;
//! let mut daemon = Daemon::builder(config.clone())
//!     .store(Arc::new(PostgresTaskStore::new(pg, config.table.clone())))
//!     .fetcher(Arc::new(RowDispatch(Deliver)))
//!     .start()
//!     .await?;
//!
//! loop {
//!     daemon.run_once().await?;
//!     tokio::time::sleep(config.sleep_interval).await;
//! }
//! ```

pub mod allocator;
pub mod config;
pub mod controller;
pub mod journal;
pub mod pool;
pub mod reliability;
pub mod results;
pub mod store;
pub mod writer;

/// Prelude for common imports
pub mod prelude {
    pub use crate::allocator::{BucketAllocator, RunIdCounter};
    pub use crate::config::{
        ConfigError, DaemonConfig, ExpiryUnit, ExpiryWindow, ResendSchedule,
    };
    pub use crate::controller::{
        BucketFetcher, Daemon, DaemonBuilder, DaemonError, DaemonState, DispatchSummary,
        FetchContext, HealthCheck, RowDispatch, RowProcessor, TaskHandles, TcpProbe,
    };
    pub use crate::journal::{FailsafeJournal, ReplayReport};
    pub use crate::pool::{PoolError, PoolTask, WorkerPool, WorkerPoolConfig};
    pub use crate::reliability::ReplayPolicy;
    pub use crate::results::{LocalResultStore, ResultBuffer, ResultEntry, ResultFlusher};
    pub use crate::store::{
        InMemoryTaskStore, PostgresTaskStore, SqlValue, StoreError, TaskRow, TaskStore,
        WriteStatement,
    };
    pub use crate::writer::{RecordWriter, WriteOutcome};
}

// Re-export key types at crate root
pub use config::{ConfigError, DaemonConfig};
pub use controller::{Daemon, DaemonError, DaemonState};
pub use store::{StoreError, TaskRow, TaskStore};
