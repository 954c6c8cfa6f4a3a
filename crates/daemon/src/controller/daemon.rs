//! The daemon state machine

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::fetch::{BucketFetcher, FetchContext};
use super::health::{HealthCheck, TcpProbe};
use super::state::DaemonState;
use crate::allocator::{BucketAllocator, RunIdCounter};
use crate::config::{ConfigError, DaemonConfig};
use crate::journal::{FailsafeJournal, ReplayReport};
use crate::pool::{BackpressureConfig, BackpressureGate, PoolError, WorkerPool, WorkerPoolConfig};
use crate::reliability::ReplayPolicy;
use crate::results::{LocalResultStore, ResultBuffer, ResultFlusher};
use crate::store::{StoreError, TaskStore};
use crate::writer::RecordWriter;

/// Daemon errors
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Worker pool error
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// A required builder component was not supplied
    #[error("daemon builder is missing {0}")]
    Missing(&'static str),

    /// Error raised by a fetcher implementation
    #[error("fetch failed: {0}")]
    Fetch(String),
}

/// Assembles a [`Daemon`]
///
/// # Example
///
/// ```ignore
/// let daemon = Daemon::builder(DaemonConfig::from_env()?)
///     .store(Arc::new(PostgresTaskStore::new(pg, "daemon_tasks")))
///     .fetcher(Arc::new(RowDispatch(MyProcessor)))
///     .result_store(Arc::new(LocalResultStore::new("/var/lib/bucketd/results.db")))
///     .start()
///     .await?;
/// ```
pub struct DaemonBuilder {
    config: DaemonConfig,
    store: Option<Arc<dyn TaskStore>>,
    health: Option<Arc<dyn HealthCheck>>,
    fetcher: Option<Arc<dyn BucketFetcher>>,
    result_store: Option<Arc<LocalResultStore>>,
}

impl DaemonBuilder {
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the default TCP probe against `database_url`
    pub fn health_check(mut self, health: Arc<dyn HealthCheck>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn BucketFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Enable the result buffer, flushed into `store`
    pub fn result_store(mut self, store: Arc<LocalResultStore>) -> Self {
        self.result_store = Some(store);
        self
    }

    /// Validate, wait for the store, sweep stale claims, and start running
    ///
    /// Blocks until the first successful health check, probing every
    /// `sleep_interval`.
    pub async fn start(self) -> Result<Daemon, DaemonError> {
        let config = self.config;
        config.validate()?;

        let store = self.store.ok_or(DaemonError::Missing("a task store"))?;
        let fetcher = self.fetcher.ok_or(DaemonError::Missing("a bucket fetcher"))?;
        let health: Arc<dyn HealthCheck> = match self.health {
            Some(health) => health,
            None => Arc::new(TcpProbe::from_config(&config)?),
        };

        let journal = Arc::new(FailsafeJournal::new(config.journal_path.clone()));
        let allocator = BucketAllocator::new(Arc::clone(&store), &config);
        let writer = RecordWriter::new(Arc::clone(&store), Arc::clone(&journal), &config);
        let backpressure = BackpressureGate::new(BackpressureConfig::new(config.max_queue_depth));
        let pool = WorkerPool::new(pool_config(&config));

        while !health.probe().await {
            warn!(
                retry_ms = config.sleep_interval.as_millis() as u64,
                "Store unreachable at startup, waiting"
            );
            tokio::time::sleep(config.sleep_interval).await;
        }

        if let Err(e) = allocator.reset_stale_claims().await {
            error!("Failed to release stale claims at startup: {}", e);
        }

        let (results, flusher) = match self.result_store {
            Some(result_store) => {
                let buffer = Arc::new(ResultBuffer::new(config.identity.clone()));
                let flusher = ResultFlusher::spawn(
                    Arc::clone(&buffer),
                    result_store,
                    config.results_flush_interval,
                );
                (Some(buffer), Some(flusher))
            }
            None => (None, None),
        };

        info!(
            table = %config.table,
            workers = config.worker_count,
            bucket_size = config.bucket_size,
            "Daemon started"
        );

        Ok(Daemon {
            run_ids: RunIdCounter::from_config(&config),
            replay_policy: ReplayPolicy::fixed(config.sleep_interval, config.replay_retries),
            state: DaemonState::Running,
            config,
            store,
            health,
            fetcher,
            journal,
            allocator,
            writer,
            backpressure,
            pool,
            results,
            flusher,
        })
    }
}

fn pool_config(config: &DaemonConfig) -> WorkerPoolConfig {
    WorkerPoolConfig::new(config.worker_count).with_join_timeout(config.pool_join_timeout)
}

/// A running table-mining daemon
///
/// Drive it by calling [`Daemon::run_once`] on a schedule:
///
/// | state       | probe | next        | actions                                   |
/// |-------------|-------|-------------|-------------------------------------------|
/// | Running     | fail  | Interrupted | clear the pool queue                      |
/// | Interrupted | fail  | Interrupted | none                                      |
/// | Interrupted | ok    | Running     | replay journal, sweep, new pool, reset ids |
/// | Running     | ok    | Running     | replay journal, fetch a bucket            |
pub struct Daemon {
    config: DaemonConfig,
    state: DaemonState,
    store: Arc<dyn TaskStore>,
    health: Arc<dyn HealthCheck>,
    fetcher: Arc<dyn BucketFetcher>,
    journal: Arc<FailsafeJournal>,
    allocator: BucketAllocator,
    writer: RecordWriter,
    backpressure: BackpressureGate,
    pool: WorkerPool,
    run_ids: RunIdCounter,
    replay_policy: ReplayPolicy,
    results: Option<Arc<ResultBuffer>>,
    flusher: Option<ResultFlusher>,
}

impl Daemon {
    pub fn builder(config: DaemonConfig) -> DaemonBuilder {
        DaemonBuilder {
            config,
            store: None,
            health: None,
            fetcher: None,
            result_store: None,
        }
    }

    /// Run one pass of the state machine and return the resulting state
    ///
    /// Never blocks waiting for the store; an unhealthy probe just moves or
    /// keeps the daemon in `Interrupted`.
    pub async fn run_once(&mut self) -> Result<DaemonState, DaemonError> {
        let healthy = self.health.probe().await;

        match (self.state, healthy) {
            (DaemonState::Running, false) => {
                let discarded = self.pool.clear_queue();
                self.state = DaemonState::Interrupted;
                warn!(discarded, "Store unreachable, suspending");
            }
            (DaemonState::Interrupted, false) => {
                debug!("Store still unreachable");
            }
            (DaemonState::Interrupted, true) | (DaemonState::Resuming, _) => {
                self.state = DaemonState::Resuming;
                info!("Store reachable again, resuming");
                self.resume().await;
                self.state = DaemonState::Running;
            }
            (DaemonState::Running, true) => {
                self.replay_journal().await;
                self.fetch().await?;
            }
        }

        Ok(self.state)
    }

    async fn fetch(&mut self) -> Result<(), DaemonError> {
        let fetcher = Arc::clone(&self.fetcher);
        let mut ctx = FetchContext {
            run_ids: &mut self.run_ids,
            allocator: &self.allocator,
            pool: &self.pool,
            backpressure: &self.backpressure,
            writer: &self.writer,
            results: self.results.as_ref(),
        };
        fetcher.fetch_bucket(&mut ctx).await
    }

    /// Recovery after an outage; failures are logged and skipped
    async fn resume(&mut self) {
        self.replay_journal().await;

        if let Err(e) = self.allocator.reset_stale_claims().await {
            error!("Failed to release stale claims while resuming: {}", e);
        }

        let old = std::mem::replace(&mut self.pool, WorkerPool::new(pool_config(&self.config)));
        old.close_now();

        self.run_ids.clamp_to_min();
        info!(
            pool_id = self.pool.pool_id(),
            run_id = self.run_ids.current(),
            "Daemon resumed"
        );
    }

    async fn replay_journal(&self) -> ReplayReport {
        self.journal
            .drain_and_replay(self.store.as_ref(), &self.replay_policy)
            .await
    }

    /// Stop fetching, drain the pool, and flush remaining results
    pub async fn shutdown(self) {
        info!(queued = self.pool.queue_depth(), "Shutting down daemon");
        self.pool.close_gracefully().await;
        if let Some(flusher) = self.flusher {
            flusher.stop().await;
        }
        info!("Daemon stopped");
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn writer(&self) -> &RecordWriter {
        &self.writer
    }

    pub fn journal(&self) -> &Arc<FailsafeJournal> {
        &self.journal
    }

    pub fn results(&self) -> Option<&Arc<ResultBuffer>> {
        self.results.as_ref()
    }

    /// Last run id handed out
    pub fn current_run_id(&self) -> i32 {
        self.run_ids.current()
    }
}
