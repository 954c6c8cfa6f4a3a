//! Bounded worker pool
//!
//! This module provides:
//! - [`WorkerPool`] - Fixed workers draining one FIFO queue
//! - [`BackpressureGate`] - Queue-depth gate consulted before fetching more work

mod backpressure;
mod worker_pool;

pub use backpressure::{BackpressureConfig, BackpressureError, BackpressureGate};
pub use worker_pool::{PoolError, PoolTask, WorkerPool, WorkerPoolConfig};
