//! Webhook delivery processor
//!
//! Each claimed row is POSTed as JSON to a fixed endpoint. Delivered rows are
//! marked processed; failed ones are rescheduled until they run out of sends,
//! then marked failed. Every attempt is recorded in the result buffer.

use std::time::Duration;

use anyhow::{Context, Result};
use bucketd_daemon::controller::{RowProcessor, TaskHandles};
use bucketd_daemon::pool::PoolTask;
use bucketd_daemon::{DaemonConfig, TaskRow};
use tracing::{debug, warn};

/// Webhook endpoint settings
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub timeout: Duration,
}

impl WebhookConfig {
    /// Read `BUCKETD_WEBHOOK_URL` and `BUCKETD_WEBHOOK_TIMEOUT_MS` (default 10000)
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("BUCKETD_WEBHOOK_URL").context("BUCKETD_WEBHOOK_URL is required")?;
        url::Url::parse(&url).context("BUCKETD_WEBHOOK_URL is not a valid URL")?;
        let timeout_ms = match std::env::var("BUCKETD_WEBHOOK_TIMEOUT_MS") {
            Ok(raw) => raw
                .trim()
                .parse::<u64>()
                .context("BUCKETD_WEBHOOK_TIMEOUT_MS must be a number of milliseconds")?,
            Err(_) => 10_000,
        };
        Ok(Self {
            url,
            timeout: Duration::from_millis(timeout_ms),
        })
    }
}

/// What to do with a row after one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Delivered,
    Retry,
    GiveUp,
}

/// Row statuses and limits the processor applies
#[derive(Debug, Clone, Copy)]
struct StatusCodes {
    processed: i32,
    unprocessed: i32,
    failed: i32,
    max_sends: u32,
}

impl StatusCodes {
    fn disposition(&self, delivered: bool, previous_sends: i32) -> Disposition {
        if delivered {
            Disposition::Delivered
        } else if i64::from(previous_sends) + 1 >= i64::from(self.max_sends) {
            Disposition::GiveUp
        } else {
            Disposition::Retry
        }
    }
}

/// Delivers rows to a webhook
#[derive(Clone)]
pub struct WebhookProcessor {
    client: reqwest::Client,
    url: String,
    codes: StatusCodes,
}

impl WebhookProcessor {
    pub fn new(webhook: WebhookConfig, config: &DaemonConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(webhook.timeout)
            .connect_timeout(webhook.timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url: webhook.url,
            codes: StatusCodes {
                processed: config.processed_status,
                unprocessed: config.unprocessed_status,
                failed: config.failed_status,
                max_sends: config.max_send_retries,
            },
        })
    }
}

impl RowProcessor for WebhookProcessor {
    fn build_task(&self, row: TaskRow, handles: TaskHandles) -> PoolTask {
        let client = self.client.clone();
        let url = self.url.clone();
        let codes = self.codes;

        Box::pin(async move {
            let (delivered, status, body) = match client.post(&url).json(&row.data).send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    (status.is_success(), i32::from(status.as_u16()), body)
                }
                Err(e) => {
                    warn!(row_id = row.id, run_id = handles.run_id, "Webhook request failed: {}", e);
                    (false, 0, e.to_string())
                }
            };

            let outcome = match codes.disposition(delivered, row.number_of_sends) {
                Disposition::Delivered => handles.writer.mark_processed(row.id, codes.processed).await,
                Disposition::Retry => handles.writer.reschedule(&row, codes.unprocessed).await,
                Disposition::GiveUp => {
                    warn!(row_id = row.id, sends = row.number_of_sends + 1, "Giving up on row");
                    handles.writer.mark_processed(row.id, codes.failed).await
                }
            };
            debug!(row_id = row.id, status, ?outcome, "Row handled");

            if let Some(results) = &handles.results {
                results.record(row.data.clone(), status, body, row.id);
            }
        })
    }
}
