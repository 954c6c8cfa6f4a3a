//! Replay policy for journaled statements

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How hard to retry a journaled mutation during replay
///
/// Attempts are spaced by a fixed interval; there is no backoff.
///
/// # Example
///
/// ```
/// use bucketd_daemon::reliability::ReplayPolicy;
/// use std::time::Duration;
///
/// let policy = ReplayPolicy::fixed(Duration::from_millis(200), 3);
/// assert!(policy.has_attempts_remaining(2));
/// assert!(!policy.has_attempts_remaining(3));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayPolicy {
    /// Maximum number of attempts (including initial)
    pub max_attempts: u32,

    /// Pause between attempts
    #[serde(with = "duration_millis")]
    pub interval: Duration,
}

impl Default for ReplayPolicy {
    /// 3 attempts, 1 second apart
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1), 3)
    }
}

impl ReplayPolicy {
    /// Fixed-interval policy
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// A single attempt
    pub fn no_retry() -> Self {
        Self::fixed(Duration::ZERO, 1)
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the pause between attempts
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Delay before the given attempt (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            self.interval
        }
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
