//! Notification transports

use crate::external::{ExternalError, Notification, Notifier};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Writes notifications to the log. Used when no webhook is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), ExternalError> {
        info!(
            subject = %notification.subject,
            recipient = notification.recipient.as_deref().unwrap_or("-"),
            "{}",
            notification.body
        );
        Ok(())
    }
}

/// POSTs each notification as JSON
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), ExternalError> {
        debug!(url = %self.url, subject = %notification.subject, "posting notification");

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(notification)
            .send()
            .await
            .map_err(|e| ExternalError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExternalError::Transport(format!(
                "webhook {} answered {}",
                self.url,
                response.status()
            )));
        }
        Ok(())
    }
}
