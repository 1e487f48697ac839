//! In-process message log
//!
//! Mirrors the PostgreSQL write transaction with optimistic concurrency: an
//! append reads the latest identifier, yields, and only commits if no other
//! append committed in between. A lost race is reported as
//! [`ChatError::Conflict`], so retry behaviour can be exercised without a
//! database.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use cw_common::{ChatMessage, Cursor, Snowflake};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{ChatError, Result};
use crate::repository::MessageRepository;

#[derive(Default)]
pub struct InMemoryMessageRepository {
    messages: Mutex<BTreeMap<Snowflake, ChatMessage>>,
    notifier: Option<mpsc::UnboundedSender<String>>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit the new identifier on `notifier` after every committed append,
    /// standing in for the database notification channel.
    pub fn with_notifier(notifier: mpsc::UnboundedSender<String>) -> Self {
        Self {
            messages: Mutex::new(BTreeMap::new()),
            notifier: Some(notifier),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn latest(&self) -> Option<Snowflake> {
        self.messages.lock().keys().next_back().copied()
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn append_once(&self, author: &str, text: &str) -> Result<ChatMessage> {
        let seen = self.latest();
        let id = Snowflake::next(seen, Utc::now())?;

        // Let concurrent writers interleave between read and commit.
        tokio::task::yield_now().await;

        let message = ChatMessage {
            id,
            author: author.to_string(),
            text: text.to_string(),
        };
        {
            let mut messages = self.messages.lock();
            if messages.keys().next_back().copied() != seen {
                return Err(ChatError::Conflict(id));
            }
            messages.insert(id, message.clone());
        }

        if let Some(notifier) = &self.notifier {
            let _ = notifier.send(id.to_string());
        }
        Ok(message)
    }

    async fn messages_after(&self, cursor: Cursor) -> Result<Vec<ChatMessage>> {
        let messages = self.messages.lock();
        let batch = match cursor.position() {
            Some(after) => messages
                .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                .map(|(_, m)| m.clone())
                .collect(),
            None => messages.values().cloned().collect(),
        };
        Ok(batch)
    }
}
