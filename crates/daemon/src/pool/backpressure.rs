//! Queue-depth backpressure for bucket fetching
//!
//! The controller asks [`BackpressureGate::should_accept`] before claiming
//! another bucket, so the pool queue never grows without bound while the
//! workers are behind.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

/// Backpressure configuration
///
/// # Example
///
/// ```
/// use bucketd_daemon::pool::BackpressureConfig;
///
/// let config = BackpressureConfig::new(500).with_resume_depth(250);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BackpressureConfig {
    /// Stop fetching once this many tasks are queued
    pub max_queue_depth: usize,

    /// Resume fetching once the queue drains to this depth
    ///
    /// Defaults to one below `max_queue_depth`, which gives a plain ceiling
    /// with no hysteresis band.
    pub resume_depth: Option<usize>,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self::new(500)
    }
}

impl BackpressureConfig {
    /// Create a configuration with the given ceiling
    pub fn new(max_queue_depth: usize) -> Self {
        Self {
            max_queue_depth,
            resume_depth: None,
        }
    }

    /// Set the depth at which fetching resumes
    pub fn with_resume_depth(mut self, depth: usize) -> Self {
        self.resume_depth = Some(depth);
        self
    }

    /// Effective resume depth
    pub fn resume_at(&self) -> usize {
        self.resume_depth
            .unwrap_or_else(|| self.max_queue_depth.saturating_sub(1))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), BackpressureError> {
        if self.max_queue_depth == 0 {
            return Err(BackpressureError::InvalidConfig(
                "max_queue_depth must be at least 1".into(),
            ));
        }
        if self.resume_at() >= self.max_queue_depth {
            return Err(BackpressureError::InvalidConfig(
                "resume_depth must be less than max_queue_depth".into(),
            ));
        }
        Ok(())
    }
}

/// Backpressure-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackpressureError {
    /// Invalid configuration
    #[error("invalid backpressure configuration: {0}")]
    InvalidConfig(String),
}

/// Accept/reject state with hysteresis between the two depths
pub struct BackpressureGate {
    config: BackpressureConfig,
    accepting: AtomicBool,
    reason: RwLock<Option<String>>,
}

impl BackpressureGate {
    /// Create a gate that starts out accepting
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            accepting: AtomicBool::new(true),
            reason: RwLock::new(None),
        }
    }

    /// Whether another bucket may be fetched given the current queue depth
    pub fn should_accept(&self, queue_depth: usize) -> bool {
        if self.accepting.load(Ordering::Relaxed) {
            if queue_depth >= self.config.max_queue_depth {
                self.accepting.store(false, Ordering::Relaxed);
                *self.reason.write() = Some(format!(
                    "queue depth {} reached limit {}",
                    queue_depth, self.config.max_queue_depth
                ));
                return false;
            }
            true
        } else {
            if queue_depth <= self.config.resume_at() {
                self.accepting.store(true, Ordering::Relaxed);
                *self.reason.write() = None;
                return true;
            }
            false
        }
    }

    /// Whether the last check accepted
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    /// Why fetching is paused, if it is
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }
}
