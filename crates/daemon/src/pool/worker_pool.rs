//! Worker pool for task execution
//!
//! A fixed set of long-lived workers drains one FIFO queue. Submitting wakes
//! exactly one idle worker; shutdown is broadcast to all of them.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A unit of work executed by the pool
pub type PoolTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Process-wide pool id sequence; starts at 0 and is never reset.
static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPoolConfig {
    /// Number of long-lived workers
    pub worker_count: usize,

    /// How long graceful shutdown waits for each worker
    pub join_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 10,
            join_timeout: Duration::from_secs(2),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration with `worker_count` workers
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
            ..Default::default()
        }
    }

    /// Set the per-worker join timeout
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }
}

/// Worker pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Work submitted after shutdown
    #[error("worker pool is closed")]
    Closed,
}

struct QueueState {
    tasks: VecDeque<PoolTask>,
    alive: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    task_available: Notify,
    shutdown_tx: watch::Sender<bool>,
    busy: AtomicUsize,
    live: AtomicUsize,
}

/// Bounded worker pool
///
/// # Example
///
/// ```ignore
/// use bucketd_daemon::pool::{WorkerPool, WorkerPoolConfig};
///
/// let pool = WorkerPool::new(WorkerPoolConfig::new(4));
/// pool.submit(async { /* work */ })?;
///
/// // Let queued work finish, then stop the workers
/// pool.close_gracefully().await;
/// ```
pub struct WorkerPool {
    id: usize,
    config: WorkerPoolConfig,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool and start its workers
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: WorkerPoolConfig) -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                alive: true,
            }),
            task_available: Notify::new(),
            shutdown_tx,
            busy: AtomicUsize::new(0),
            live: AtomicUsize::new(config.worker_count),
        });

        let workers = (0..config.worker_count)
            .map(|worker_id| {
                let shutdown_rx = shared.shutdown_tx.subscribe();
                tokio::spawn(run_worker(id, worker_id, Arc::clone(&shared), shutdown_rx))
            })
            .collect();

        info!(
            pool_id = id,
            workers = config.worker_count,
            "Started worker pool"
        );

        Self {
            id,
            config,
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a task; returns immediately
    ///
    /// Wakes one idle worker. Fails with [`PoolError::Closed`] after either
    /// shutdown mode has begun.
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            if !state.alive {
                return Err(PoolError::Closed);
            }
            state.tasks.push_back(Box::pin(task));
        }
        self.shared.task_available.notify_one();
        Ok(())
    }

    /// Close immediately, discarding queued tasks
    ///
    /// Idle workers exit at once; tasks already running finish on their own.
    /// Returns the number of discarded tasks.
    pub fn close_now(&self) -> usize {
        let discarded = {
            let mut state = self.shared.state.lock();
            state.alive = false;
            std::mem::take(&mut state.tasks)
        };
        let _ = self.shared.shutdown_tx.send(true);

        let count = discarded.len();
        drop(discarded);
        info!(pool_id = self.id, discarded = count, "Closed worker pool");
        count
    }

    /// Close after draining queued tasks
    ///
    /// New submissions are rejected right away. Each worker is given
    /// `join_timeout` to finish; stragglers are left running detached.
    pub async fn close_gracefully(&self) {
        self.shared.state.lock().alive = false;
        let _ = self.shared.shutdown_tx.send(true);

        info!(
            pool_id = self.id,
            queued = self.queue_depth(),
            "Draining worker pool"
        );

        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            match tokio::time::timeout(self.config.join_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(pool_id = self.id, "Worker terminated abnormally: {}", e),
                Err(_) => warn!(
                    pool_id = self.id,
                    timeout_ms = self.config.join_timeout.as_millis() as u64,
                    "Worker did not finish in time"
                ),
            }
        }

        debug!(pool_id = self.id, "Worker pool drained");
    }

    /// Discard queued tasks without closing; returns how many were dropped
    pub fn clear_queue(&self) -> usize {
        let discarded = std::mem::take(&mut self.shared.state.lock().tasks);
        discarded.len()
    }

    /// Tasks waiting for a worker
    pub fn queue_depth(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Workers currently executing a task
    pub fn busy_workers(&self) -> usize {
        self.shared.busy.load(Ordering::SeqCst)
    }

    /// Workers still running and waiting for work
    pub fn idle_workers(&self) -> usize {
        self.live_workers().saturating_sub(self.busy_workers())
    }

    /// Workers that have not exited
    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Whether shutdown has begun
    pub fn is_closed(&self) -> bool {
        !self.shared.state.lock().alive
    }

    /// Process-unique pool id
    pub fn pool_id(&self) -> usize {
        self.id
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let discarded = {
            let mut state = self.shared.state.lock();
            state.alive = false;
            std::mem::take(&mut state.tasks)
        };
        let _ = self.shared.shutdown_tx.send(true);
        drop(discarded);
    }
}

async fn run_worker(
    pool_id: usize,
    worker_id: usize,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(pool_id, worker_id, "Worker started");

    while let Some(task) = next_task(&shared, &mut shutdown_rx).await {
        if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
            error!(
                pool_id,
                worker_id,
                panic = %panic_message(panic.as_ref()),
                "Task panicked"
            );
        }
        shared.busy.fetch_sub(1, Ordering::SeqCst);
    }

    shared.live.fetch_sub(1, Ordering::SeqCst);
    debug!(pool_id, worker_id, "Worker exited");
}

/// Block until a task is available or the pool is closed with an empty queue
///
/// A task is returned with the busy count already raised, under the same
/// lock that popped it.
async fn next_task(shared: &Shared, shutdown_rx: &mut watch::Receiver<bool>) -> Option<PoolTask> {
    loop {
        // A submit landing between the check and the await leaves a permit
        // on the Notify, so its wakeup is not lost.
        let notified = shared.task_available.notified();
        {
            let mut state = shared.state.lock();
            if let Some(task) = state.tasks.pop_front() {
                shared.busy.fetch_add(1, Ordering::SeqCst);
                return Some(task);
            }
            if !state.alive {
                return None;
            }
        }

        tokio::select! {
            _ = notified => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
