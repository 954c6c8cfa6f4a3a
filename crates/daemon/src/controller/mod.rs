//! Daemon controller
//!
//! This module provides:
//! - [`Daemon`] - The RUNNING / INTERRUPTED / RESUMING state machine
//! - [`HealthCheck`] - Store liveness probe, with [`TcpProbe`] as default
//! - [`BucketFetcher`] and [`RowProcessor`] - Where daemon-specific work plugs in

mod daemon;
mod fetch;
mod health;
mod state;

pub use daemon::{Daemon, DaemonBuilder, DaemonError};
pub use fetch::{
    BucketFetcher, DispatchSummary, FetchContext, RowDispatch, RowProcessor, TaskHandles,
};
pub use health::{HealthCheck, TcpProbe};
pub use state::DaemonState;
