//! Slack incoming-webhook notification sink.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::channels::NotificationSink;
use crate::config::env_string;
use crate::error::NotifyError;

/// Posts digest text to a Slack incoming webhook.
pub struct SlackWebhook {
    url: SecretString,
    timeout: Duration,
    client: reqwest::Client,
}

impl SlackWebhook {
    pub fn new(url: SecretString, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Request(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            url,
            timeout,
            client,
        })
    }

    /// Build from `SLACK_WEBHOOK_URL`. Returns `None` if unset.
    pub fn from_env(timeout: Duration) -> Option<Result<Self, NotifyError>> {
        env_string("SLACK_WEBHOOK_URL").map(|url| Self::new(SecretString::from(url), timeout))
    }
}

#[async_trait]
impl NotificationSink for SlackWebhook {
    fn name(&self) -> &str {
        "slack"
    }

    async fn deliver(&self, text: &str) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(self.url.expose_secret())
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NotifyError::Timeout(self.timeout)
                } else {
                    NotifyError::Request(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        debug!(chars = text.chars().count(), "Digest posted to Slack");
        Ok(())
    }
}
