//! Notification delivery for `send_notification` actions

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{FlowError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: String,
    pub connection_id: String,
    pub workflow_id: String,
    pub thread_id: String,
    pub title: String,
    pub message: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        info!(
            user_id = %notification.user_id,
            workflow_id = %notification.workflow_id,
            thread_id = %notification.thread_id,
            "Notification: {} - {}",
            notification.title,
            notification.message
        );
        Ok(())
    }
}

/// POSTs notifications as JSON to a webhook
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FlowError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        debug!("Posting notification to {}", self.url);
        let resp = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| FlowError::Network(format!("Webhook request failed: {}", e)))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(FlowError::RateLimited(format!("Webhook returned {}", status)));
        }
        if !status.is_success() {
            return Err(FlowError::Network(format!("Webhook returned {}", status)));
        }
        Ok(())
    }
}
