//! Replay feed for one subscriber
//!
//! Reads everything after the subscriber's cursor once immediately, then again
//! on every wake-up from its registry endpoint, pushing each non-empty batch
//! to a [`BatchSink`]. The feed ends cleanly when the endpoint is closed and
//! with a [`FeedError`] on the first failed read or push.

use async_trait::async_trait;
use cw_broadcast::Subscription;
use cw_common::{ChatMessage, Cursor};
use thiserror::Error;
use tracing::debug;

use crate::error::ChatError;
use crate::repository::MessageRepository;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to read messages: {0}")]
    Query(#[from] ChatError),

    #[error("Failed to push messages: {0}")]
    Push(String),
}

/// Destination of replayed batches, usually a client connection.
#[async_trait]
pub trait BatchSink: Send {
    async fn push(&mut self, batch: &[ChatMessage]) -> anyhow::Result<()>;
}

/// Run the feed until `wakeups` ends. Returns the final cursor.
///
/// The subscription is consumed and its endpoint dropped when the feed
/// returns, so a fan-out waiting on it is released even while the endpoint is
/// still registered.
pub async fn run_feed<T, S>(
    repository: &dyn MessageRepository,
    mut cursor: Cursor,
    mut wakeups: Subscription<T>,
    sink: &mut S,
) -> Result<Cursor, FeedError>
where
    T: Send,
    S: BatchSink,
{
    loop {
        let batch = repository.messages_after(cursor).await?;
        if !batch.is_empty() {
            cursor.advance(&batch);
            debug!("[{}] Pushing {} messages", wakeups.id(), batch.len());
            sink.push(&batch).await.map_err(|e| FeedError::Push(e.to_string()))?;
        }

        if wakeups.recv().await.is_none() {
            debug!("[{}] Endpoint closed, feed finished", wakeups.id());
            return Ok(cursor);
        }
    }
}
