//! Herald notification sinks.
//!
//! [`WebhookNotifier`] POSTs `{"message", "deploymentname"}` to a configured endpoint
//! with a bounded timeout. Transport errors, timeouts and non-2xx statuses are all
//! failures; the response body is only logged. No retries happen here.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use herald_core::{Notification, Notifier, NotifyError};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookNotifier {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook http client")?;
        Ok(Self { http, endpoint: endpoint.into(), timeout })
    }

    pub fn endpoint(&self) -> &str { &self.endpoint }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let t0 = Instant::now();
        let res = self.http.post(&self.endpoint).json(notification).send().await;
        let resp = match res {
            Ok(r) => r,
            Err(e) => {
                counter!("notify_failed_total", 1u64);
                if e.is_builder() {
                    return Err(NotifyError::Encode(e.to_string()));
                }
                if e.is_timeout() {
                    warn!(endpoint = %self.endpoint, timeout = ?self.timeout, "notification timed out");
                    return Err(NotifyError::Timeout(self.timeout));
                }
                warn!(endpoint = %self.endpoint, error = %e, "notification request failed");
                return Err(NotifyError::Request(e.to_string()));
            }
        };
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        histogram!("notify_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if !status.is_success() {
            counter!("notify_failed_total", 1u64);
            warn!(endpoint = %self.endpoint, status = status.as_u16(), body = %text, "notification rejected");
            return Err(NotifyError::Rejected { status: status.as_u16() });
        }
        counter!("notify_sent_total", 1u64);
        info!(deployment = %notification.deployment_name, status = status.as_u16(), "notification sent");
        debug!(body = %text, "sink response");
        Ok(())
    }
}

/// Sink that only logs; used by `heraldctl replay` when nothing should leave the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(deployment = %notification.deployment_name, message = %notification.message, "notification (log sink)");
        counter!("notify_sent_total", 1u64);
        Ok(())
    }
}
