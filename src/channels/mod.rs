//! External collaborators at the edges of the pipeline: where emails come
//! from and where digests go.

pub mod imap;
pub mod slack;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{NotifyError, SourceError};
use crate::pipeline::types::RawEmail;

pub use imap::{ImapConfig, ImapSource};
pub use slack::SlackWebhook;

/// Yields support emails received since a point in time.
///
/// Each call is one-shot: a failed fetch is retried by calling `fetch` again,
/// never by resuming a partial sequence.
#[async_trait]
pub trait EmailSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, since: DateTime<Utc>) -> Result<Vec<RawEmail>, SourceError>;
}

/// Delivers digest text to a human-facing channel.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, text: &str) -> Result<(), NotifyError>;
}

/// Sink used when no webhook is configured: the digest only goes to the log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, text: &str) -> Result<(), NotifyError> {
        tracing::info!(chars = text.chars().count(), "Digest (no sink configured):\n{text}");
        Ok(())
    }
}
