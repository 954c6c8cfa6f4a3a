//! Persistence layer for the shared task table
//!
//! This module provides:
//! - [`TaskStore`] trait for allocation, claim resets and writes
//! - [`PostgresTaskStore`] for production
//! - [`InMemoryTaskStore`] for testing
//! - [`WriteStatement`] and literal rendering for the failsafe journal

pub mod literal;
mod memory;
mod postgres;
#[allow(clippy::module_inception)]
mod store;

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use store::{AllocationFilter, SqlValue, StoreError, TaskRow, TaskStore, WriteStatement};
