//! Daemon configuration
//!
//! Settings are read once at startup. Every problem found while loading is
//! collected so the operator sees all of them at once; any problem is fatal.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default journal file for failed write statements
pub const DEFAULT_JOURNAL_PATH: &str = "FAILED_QUERIES.TXT";

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// One or more settings could not be loaded
    #[error("{} error(s) while loading configuration: {}", .0.len(), .0.join("; "))]
    Load(Vec<String>),

    /// Settings loaded but are inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Unit used for the row expiry window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExpiryUnit {
    Minute,
    Hour,
    Day,
}

impl ExpiryUnit {
    /// Length of one unit in minutes
    pub fn minutes(&self) -> i64 {
        match self {
            Self::Minute => 1,
            Self::Hour => 60,
            Self::Day => 60 * 24,
        }
    }
}

impl std::str::FromStr for ExpiryUnit {
    type Err = std::convert::Infallible;

    /// Unknown units fall back to hours, matching the allocation statement's
    /// `ELSE` branch in the legacy schema.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_uppercase().as_str() {
            "MINUTE" => Self::Minute,
            "DAY" => Self::Day,
            _ => Self::Hour,
        })
    }
}

impl std::fmt::Display for ExpiryUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minute => write!(f, "MINUTE"),
            Self::Hour => write!(f, "HOUR"),
            Self::Day => write!(f, "DAY"),
        }
    }
}

/// Rows older than `value` units (by `date_created`) are never allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryWindow {
    pub unit: ExpiryUnit,
    pub value: u32,
}

impl ExpiryWindow {
    pub fn new(unit: ExpiryUnit, value: u32) -> Self {
        Self { unit, value }
    }

    /// Window length in whole minutes
    pub fn total_minutes(&self) -> i64 {
        self.unit.minutes() * i64::from(self.value)
    }

    /// Window length as a chrono duration
    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.total_minutes())
    }
}

/// When a rescheduled row becomes eligible again
///
/// The tiered form is configured as `"first|second|third"` minutes:
/// rows sent fewer than 3 times wait `first`, fewer than 6 wait `second`,
/// everything else waits `third`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResendSchedule {
    /// Eligible again right away
    Immediate,
    /// Delay in minutes chosen by attempt count
    Tiered { first: u32, second: u32, third: u32 },
}

impl ResendSchedule {
    /// Parse `"a|b|c"`; anything without a `|` means immediate.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if !raw.contains('|') {
            return Ok(Self::Immediate);
        }
        let tiers = raw
            .split('|')
            .map(|t| t.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("resend tiers must be minutes: {e}"))?;
        match tiers.as_slice() {
            [first, second, third] => Ok(Self::Tiered {
                first: *first,
                second: *second,
                third: *third,
            }),
            _ => Err(format!("expected 3 resend tiers, got {}", tiers.len())),
        }
    }

    /// Delay before the next send, given how many sends already happened
    pub fn delay_for(&self, number_of_sends: i32) -> chrono::Duration {
        match *self {
            Self::Immediate => chrono::Duration::zero(),
            Self::Tiered {
                first,
                second,
                third,
            } => {
                let minutes = if number_of_sends < 3 {
                    first
                } else if number_of_sends < 6 {
                    second
                } else {
                    third
                };
                chrono::Duration::minutes(i64::from(minutes))
            }
        }
    }
}

/// Full daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Store connection string (also the health probe target)
    pub database_url: String,

    /// Shared task table
    pub table: String,

    /// Identity written as `inserted_by` into the result store
    pub identity: String,

    /// Number of pool workers
    pub worker_count: usize,

    /// Maximum rows claimed per allocation
    pub bucket_size: u32,

    /// Sleep between health probes and replay attempts; also the probe timeout
    #[serde(with = "duration_millis")]
    pub sleep_interval: Duration,

    /// Queue depth at which no further rows are claimed
    pub max_queue_depth: usize,

    /// Rows with this many sends or more are never allocated
    pub max_send_retries: u32,

    /// Attempts per journaled mutation during replay
    pub replay_retries: u32,

    pub startup_run_id: i32,
    pub min_run_id: i32,
    pub max_run_id: i32,

    pub processed_status: i32,
    pub unprocessed_status: i32,
    pub failed_status: i32,

    pub expiry: ExpiryWindow,
    pub resend: ResendSchedule,

    /// Failsafe journal file
    pub journal_path: PathBuf,

    /// SQLite file for the result buffer
    pub results_db_path: PathBuf,

    /// Result buffer flush period
    #[serde(with = "duration_millis")]
    pub results_flush_interval: Duration,

    /// Bounded wait per worker during graceful shutdown
    #[serde(with = "duration_millis")]
    pub pool_join_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost:5432/bucketd".to_string(),
            table: "daemon_tasks".to_string(),
            identity: "daemon_tasks".to_string(),
            worker_count: 10,
            bucket_size: 100,
            sleep_interval: Duration::from_secs(5),
            max_queue_depth: 1000,
            max_send_retries: 5,
            replay_retries: 5,
            startup_run_id: 1,
            min_run_id: 1,
            max_run_id: 1000,
            processed_status: 1,
            unprocessed_status: 0,
            failed_status: 3,
            expiry: ExpiryWindow::new(ExpiryUnit::Hour, 24),
            resend: ResendSchedule::Immediate,
            journal_path: PathBuf::from(DEFAULT_JOURNAL_PATH),
            results_db_path: PathBuf::from("/tmp/sqlite/bucketd/resultsApi.db"),
            results_flush_interval: Duration::from_secs(20),
            pool_join_timeout: Duration::from_secs(2),
        }
    }
}

impl DaemonConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    ///
    /// Required keys: `DATABASE_URL`, `BUCKETD_TABLE`, `BUCKETD_WORKERS`,
    /// `BUCKETD_BUCKET_SIZE`, `BUCKETD_SLEEP_TIME_MS`, `BUCKETD_MAX_QUEUE_DEPTH`,
    /// `BUCKETD_MAX_SENDS`, `BUCKETD_CURRENT_RUN_AT_STARTUP`,
    /// `BUCKETD_MIN_RUN_ID`, `BUCKETD_MAX_RUN_ID`, `BUCKETD_PROCESSED_STATUS`,
    /// `BUCKETD_UNPROCESSED_STATUS`, `BUCKETD_FAILED_STATUS`,
    /// `BUCKETD_EXPIRY_UNIT`, `BUCKETD_EXPIRY_VALUE`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut reader = EnvReader {
            lookup: &lookup,
            errors: Vec::new(),
        };
        let defaults = Self::default();

        let database_url = reader.string("DATABASE_URL");
        let table = reader.string("BUCKETD_TABLE");
        let worker_count = reader.number::<usize>("BUCKETD_WORKERS");
        let bucket_size = reader.number::<u32>("BUCKETD_BUCKET_SIZE");
        let sleep_ms = reader.number::<u64>("BUCKETD_SLEEP_TIME_MS");
        let max_queue_depth = reader.number::<usize>("BUCKETD_MAX_QUEUE_DEPTH");
        let max_send_retries = reader.number::<u32>("BUCKETD_MAX_SENDS");
        let startup_run_id = reader.number::<i32>("BUCKETD_CURRENT_RUN_AT_STARTUP");
        let min_run_id = reader.number::<i32>("BUCKETD_MIN_RUN_ID");
        let max_run_id = reader.number::<i32>("BUCKETD_MAX_RUN_ID");
        let processed_status = reader.number::<i32>("BUCKETD_PROCESSED_STATUS");
        let unprocessed_status = reader.number::<i32>("BUCKETD_UNPROCESSED_STATUS");
        let failed_status = reader.number::<i32>("BUCKETD_FAILED_STATUS");
        let expiry_unit = reader.string("BUCKETD_EXPIRY_UNIT");
        let expiry_value = reader.number::<u32>("BUCKETD_EXPIRY_VALUE");

        let resend = match lookup("BUCKETD_NEXT_SEND_TIERS") {
            Some(raw) => match ResendSchedule::parse(&raw) {
                Ok(schedule) => schedule,
                Err(e) => {
                    reader.errors.push(format!("BUCKETD_NEXT_SEND_TIERS: {e}"));
                    ResendSchedule::Immediate
                }
            },
            None => ResendSchedule::Immediate,
        };
        let replay_retries = reader.optional_number::<u32>("BUCKETD_REPLAY_RETRIES");
        let flush_ms = reader.optional_number::<u64>("BUCKETD_RESULTS_FLUSH_MS");

        if !reader.errors.is_empty() {
            return Err(ConfigError::Load(reader.errors));
        }

        // All required values are present past this point.
        let table = table.unwrap_or_default();
        let max_send_retries = max_send_retries.unwrap_or_default();
        let config = Self {
            database_url: database_url.unwrap_or_default(),
            identity: lookup("BUCKETD_IDENTITY").unwrap_or_else(|| table.clone()),
            table,
            worker_count: worker_count.unwrap_or_default(),
            bucket_size: bucket_size.unwrap_or_default(),
            sleep_interval: Duration::from_millis(sleep_ms.unwrap_or_default()),
            max_queue_depth: max_queue_depth.unwrap_or_default(),
            max_send_retries,
            replay_retries: replay_retries.unwrap_or(max_send_retries),
            startup_run_id: startup_run_id.unwrap_or_default(),
            min_run_id: min_run_id.unwrap_or_default(),
            max_run_id: max_run_id.unwrap_or_default(),
            processed_status: processed_status.unwrap_or_default(),
            unprocessed_status: unprocessed_status.unwrap_or_default(),
            failed_status: failed_status.unwrap_or_default(),
            expiry: ExpiryWindow::new(
                expiry_unit.unwrap_or_default().parse().unwrap_or(ExpiryUnit::Hour),
                expiry_value.unwrap_or_default(),
            ),
            resend,
            journal_path: lookup("BUCKETD_JOURNAL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.journal_path),
            results_db_path: lookup("BUCKETD_RESULTS_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.results_db_path),
            results_flush_interval: flush_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.results_flush_interval),
            pool_join_timeout: defaults.pool_join_timeout,
        };

        config.validate()?;
        Ok(config)
    }

    /// Set the shared task table
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Set the result-store identity
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Set the number of pool workers
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Set the allocation limit
    pub fn with_bucket_size(mut self, size: u32) -> Self {
        self.bucket_size = size;
        self
    }

    /// Set the sleep interval
    pub fn with_sleep_interval(mut self, interval: Duration) -> Self {
        self.sleep_interval = interval;
        self
    }

    /// Set the queue depth ceiling
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set the run id bounds and starting point
    pub fn with_run_ids(mut self, startup: i32, min: i32, max: i32) -> Self {
        self.startup_run_id = startup;
        self.min_run_id = min;
        self.max_run_id = max;
        self
    }

    /// Set the send ceiling
    pub fn with_max_send_retries(mut self, retries: u32) -> Self {
        self.max_send_retries = retries;
        self
    }

    /// Set replay attempts per journaled mutation
    pub fn with_replay_retries(mut self, retries: u32) -> Self {
        self.replay_retries = retries;
        self
    }

    /// Set the expiry window
    pub fn with_expiry(mut self, expiry: ExpiryWindow) -> Self {
        self.expiry = expiry;
        self
    }

    /// Set the resend schedule
    pub fn with_resend(mut self, resend: ResendSchedule) -> Self {
        self.resend = resend;
        self
    }

    /// Set the journal file
    pub fn with_journal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_path = path.into();
        self
    }

    /// Set the result store file
    pub fn with_results_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_db_path = path.into();
        self
    }

    /// Set the result flush interval
    pub fn with_results_flush_interval(mut self, interval: Duration) -> Self {
        self.results_flush_interval = interval;
        self
    }

    /// Set the graceful join timeout per worker
    pub fn with_pool_join_timeout(mut self, timeout: Duration) -> Self {
        self.pool_join_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_identifier(&self.table) {
            return Err(ConfigError::Invalid(format!(
                "table name {:?} must be a plain SQL identifier",
                self.table
            )));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker count must be at least 1".into()));
        }
        if self.bucket_size == 0 {
            return Err(ConfigError::Invalid("bucket size must be at least 1".into()));
        }
        if self.max_queue_depth == 0 {
            return Err(ConfigError::Invalid("max queue depth must be at least 1".into()));
        }
        if self.min_run_id < 1 {
            return Err(ConfigError::Invalid(
                "min run id must be positive; 0 marks unclaimed rows".into(),
            ));
        }
        if self.min_run_id > self.max_run_id {
            return Err(ConfigError::Invalid(format!(
                "min run id {} exceeds max run id {}",
                self.min_run_id, self.max_run_id
            )));
        }
        Ok(())
    }

    /// `host:port` of the store, for the health probe
    ///
    /// PostgreSQL URLs without a port default to 5432.
    pub fn store_address(&self) -> Result<String, ConfigError> {
        let url = url::Url::parse(&self.database_url)
            .map_err(|e| ConfigError::Invalid(format!("DATABASE_URL: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::Invalid("DATABASE_URL has no host".into()))?;
        let port = url.port_or_known_default().unwrap_or(5432);
        Ok(format!("{host}:{port}"))
    }
}

/// Plain identifiers only: letters, digits, underscores, optional schema dot
fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            !part.is_empty()
                && !part.starts_with(|c: char| c.is_ascii_digit())
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

struct EnvReader<'a, F> {
    lookup: &'a F,
    errors: Vec<String>,
}

impl<F> EnvReader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&mut self, key: &str) -> Option<String> {
        match (self.lookup)(key) {
            Some(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
            _ => {
                self.errors.push(format!("{key} is required"));
                None
            }
        }
    }

    fn number<T: std::str::FromStr>(&mut self, key: &str) -> Option<T> {
        let raw = self.string(key)?;
        self.parse(key, &raw)
    }

    fn optional_number<T: std::str::FromStr>(&mut self, key: &str) -> Option<T> {
        let raw = (self.lookup)(key)?;
        self.parse(key, raw.trim())
    }

    fn parse<T: std::str::FromStr>(&mut self, key: &str, raw: &str) -> Option<T> {
        match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                self.errors.push(format!("{key} is not a valid number: {raw:?}"));
                None
            }
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn full_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("DATABASE_URL", "postgres://db.internal/payments"),
            ("BUCKETD_TABLE", "outbound_requests"),
            ("BUCKETD_WORKERS", "4"),
            ("BUCKETD_BUCKET_SIZE", "50"),
            ("BUCKETD_SLEEP_TIME_MS", "3000"),
            ("BUCKETD_MAX_QUEUE_DEPTH", "200"),
            ("BUCKETD_MAX_SENDS", "7"),
            ("BUCKETD_CURRENT_RUN_AT_STARTUP", "1"),
            ("BUCKETD_MIN_RUN_ID", "1"),
            ("BUCKETD_MAX_RUN_ID", "500"),
            ("BUCKETD_PROCESSED_STATUS", "1"),
            ("BUCKETD_UNPROCESSED_STATUS", "0"),
            ("BUCKETD_FAILED_STATUS", "3"),
            ("BUCKETD_EXPIRY_UNIT", "day"),
            ("BUCKETD_EXPIRY_VALUE", "2"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<DaemonConfig, ConfigError> {
        DaemonConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn test_load_from_lookup() {
        let config = load(&full_env()).unwrap();
        assert_eq!(config.table, "outbound_requests");
        assert_eq!(config.identity, "outbound_requests");
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.sleep_interval, Duration::from_secs(3));
        assert_eq!(config.expiry, ExpiryWindow::new(ExpiryUnit::Day, 2));
        assert_eq!(config.replay_retries, 7);
        assert_eq!(config.resend, ResendSchedule::Immediate);
        assert_eq!(config.journal_path, PathBuf::from(DEFAULT_JOURNAL_PATH));
        assert_eq!(config.results_flush_interval, Duration::from_secs(20));
    }

    #[test]
    fn test_load_collects_every_error() {
        let mut env = full_env();
        env.remove("BUCKETD_TABLE");
        env.remove("BUCKETD_MAX_RUN_ID");
        env.insert("BUCKETD_WORKERS", "many");

        match load(&env) {
            Err(ConfigError::Load(errors)) => {
                assert_eq!(errors.len(), 3);
                assert!(errors.iter().any(|e| e.contains("BUCKETD_TABLE")));
                assert!(errors.iter().any(|e| e.contains("BUCKETD_WORKERS")));
            }
            other => panic!("expected load errors, got {other:?}"),
        }
    }

    #[test]
    fn test_run_id_bounds_validated() {
        let mut env = full_env();
        env.insert("BUCKETD_MIN_RUN_ID", "10");
        env.insert("BUCKETD_MAX_RUN_ID", "5");
        assert!(matches!(load(&env), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_table_must_be_identifier() {
        let config = DaemonConfig::default().with_table("tasks; DROP TABLE x");
        assert!(config.validate().is_err());
        assert!(DaemonConfig::default()
            .with_table("queue.outbound_requests")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_unknown_expiry_unit_falls_back_to_hours() {
        assert_eq!("week".parse::<ExpiryUnit>().unwrap(), ExpiryUnit::Hour);
        assert_eq!("Minute".parse::<ExpiryUnit>().unwrap(), ExpiryUnit::Minute);
        assert_eq!(ExpiryWindow::new(ExpiryUnit::Day, 2).total_minutes(), 2880);
    }

    #[test]
    fn test_resend_tiers() {
        let schedule = ResendSchedule::parse("5|15|60").unwrap();
        assert_eq!(schedule.delay_for(0), chrono::Duration::minutes(5));
        assert_eq!(schedule.delay_for(2), chrono::Duration::minutes(5));
        assert_eq!(schedule.delay_for(3), chrono::Duration::minutes(15));
        assert_eq!(schedule.delay_for(6), chrono::Duration::minutes(60));

        assert_eq!(ResendSchedule::parse("now").unwrap(), ResendSchedule::Immediate);
        assert!(ResendSchedule::parse("5|x|60").is_err());
        assert!(ResendSchedule::parse("5|15").is_err());
    }

    #[test]
    fn test_store_address() {
        let config = load(&full_env()).unwrap();
        assert_eq!(config.store_address().unwrap(), "db.internal:5432");

        let config = DaemonConfig {
            database_url: "postgres://u:p@10.0.0.5:6432/db".into(),
            ..Default::default()
        };
        assert_eq!(config.store_address().unwrap(), "10.0.0.5:6432");
    }
}
