//! Reliability patterns for write recovery
//!
//! This module provides:
//! - [`ReplayPolicy`] - Fixed-interval retry used when replaying the journal

mod retry;

pub use retry::ReplayPolicy;
