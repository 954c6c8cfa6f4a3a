//! Store health checks

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::{ConfigError, DaemonConfig};

/// Liveness probe the controller runs before every pass
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// `true` when the store can be reached
    async fn probe(&self) -> bool;
}

/// Probe that opens a TCP connection to the store
///
/// A completed handshake counts as healthy; the socket is closed at once.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    /// Probe the host and port of `database_url`, timing out after
    /// `sleep_interval`
    pub fn from_config(config: &DaemonConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.store_address()?, config.sleep_interval))
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl HealthCheck for TcpProbe {
    async fn probe(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(address = %self.address, "Store probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!(address = %self.address, "Store probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let probe = TcpProbe::new(address, Duration::from_secs(1));
        assert!(probe.probe().await);
    }

    #[tokio::test]
    async fn test_probe_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let probe = TcpProbe::new(address, Duration::from_secs(1));
        assert!(!probe.probe().await);
    }

    #[test]
    fn test_from_config_uses_database_url() {
        let mut config = DaemonConfig::default().with_sleep_interval(Duration::from_millis(750));
        config.database_url = "postgres://user:pw@db.internal/tasks".to_string();

        let probe = TcpProbe::from_config(&config).unwrap();
        assert_eq!(probe.address(), "db.internal:5432");
        assert_eq!(probe.timeout, Duration::from_millis(750));
    }
}
