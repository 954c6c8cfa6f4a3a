//! Daemon lifecycle states

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where the controller stands with respect to the store
///
/// `Resuming` only exists inside a single pass: a daemon that starts
/// resuming finishes recovery and reports `Running` in the same call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    /// Store reachable; buckets are being fetched
    Running,
    /// Store unreachable; no work is fetched or dispatched
    Interrupted,
    /// Store back; recovery in progress
    Resuming,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Interrupted => "interrupted",
            Self::Resuming => "resuming",
        }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
