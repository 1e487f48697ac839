use std::sync::Arc;

use cw_common::{ChatMessage, Cursor};
use tracing::info;

use crate::error::{ChatError, Result};
use crate::repository::MessageRepository;
use crate::retry::{retry_on_conflict, RetryPolicy};

/// Chat settings
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Author name given to sessions that have not chosen one.
    pub default_author: String,
    pub retry: RetryPolicy,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_author: "robbie".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Write and read paths over a [`MessageRepository`].
#[derive(Clone)]
pub struct ChatService {
    repository: Arc<dyn MessageRepository>,
    retry: RetryPolicy,
}

impl ChatService {
    pub fn new(repository: Arc<dyn MessageRepository>, retry: RetryPolicy) -> Self {
        Self { repository, retry }
    }

    pub fn repository(&self) -> Arc<dyn MessageRepository> {
        self.repository.clone()
    }

    /// Record `text` from `author`.
    ///
    /// Surrounding whitespace is trimmed; a blank message records nothing and
    /// returns `None`. Write conflicts are retried per the configured policy.
    pub async fn post(&self, author: &str, text: &str) -> Result<Option<ChatMessage>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let message = retry_on_conflict(&self.retry, ChatError::is_conflict, || {
            self.repository.append_once(author, text)
        })
        .await?;

        metrics::counter!("chatwire_messages_posted_total").increment(1);
        info!("[{}] Message posted by {}", message.id, author);
        Ok(Some(message))
    }

    pub async fn history(&self) -> Result<Vec<ChatMessage>> {
        self.repository.all_messages().await
    }

    pub async fn messages_after(&self, cursor: Cursor) -> Result<Vec<ChatMessage>> {
        self.repository.messages_after(cursor).await
    }
}
