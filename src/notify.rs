//! Notification collaborator: delivers the per-account report.
//!
//! Delivery failure never rolls back dispatched actions. The scheduler logs it
//! and counts the account run as complete.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::llm::retry_after_ms;
use crate::retry::{with_retry, ProviderError, RetryPolicy};

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub account_id: i64,
    pub account_name: String,
    pub run_id: Uuid,
    pub text: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), ProviderError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Webhook receiving `{account_id, account_name, run_id, text}`. Reports
    /// are only logged when unset.
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 15,
            retry: RetryPolicy::default(),
        }
    }
}

/// Build the notifier selected by configuration.
pub fn from_config(config: &NotifyConfig) -> anyhow::Result<std::sync::Arc<dyn Notifier>> {
    Ok(match &config.webhook_url {
        Some(url) => std::sync::Arc::new(WebhookNotifier::new(url, config)?),
        None => std::sync::Arc::new(LogNotifier),
    })
}

pub struct WebhookNotifier {
    http: reqwest::Client,
    url: url::Url,
    retry: RetryPolicy,
}

impl WebhookNotifier {
    pub fn new(url: &str, config: &NotifyConfig) -> anyhow::Result<Self> {
        let url = url::Url::parse(url)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            url,
            retry: config.retry.clone(),
        })
    }

    async fn post(&self, notification: &Notification) -> Result<(), ProviderError> {
        let resp = self.http.post(self.url.clone()).json(notification).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let retry_after = retry_after_ms(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        Err(ProviderError::from_status(status.as_u16(), &body, retry_after))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), ProviderError> {
        with_retry(&self.retry, "notify.webhook", || self.post(notification)).await
    }
}

/// Writes the report to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), ProviderError> {
        info!(
            account_id = notification.account_id,
            run_id = %notification.run_id,
            report = %notification.text,
            "account report"
        );
        Ok(())
    }
}
