use async_trait::async_trait;
use cw_common::{ChatMessage, Cursor};

use crate::error::Result;

/// Durable, append-only message log.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// One attempt at recording a message under the next identifier and
    /// signalling subscribers. Fails with a conflict when a concurrent writer
    /// won the race; the caller decides whether to retry.
    async fn append_once(&self, author: &str, text: &str) -> Result<ChatMessage>;

    /// Messages strictly after `cursor`, in identifier order.
    async fn messages_after(&self, cursor: Cursor) -> Result<Vec<ChatMessage>>;

    async fn all_messages(&self) -> Result<Vec<ChatMessage>> {
        self.messages_after(Cursor::BEGINNING).await
    }
}
