//! Chatwire messages
//!
//! - Write path: [`ChatService::post`] records a message under the next
//!   [`cw_common::Snowflake`] inside a serializable transaction and retries on
//!   write conflicts ([`retry_on_conflict`]).
//! - Read path: [`run_feed`] replays messages after a subscriber's cursor and
//!   keeps it current on every wake-up.

pub mod error;
pub mod feed;
pub mod memory;
pub mod postgres;
pub mod repository;
pub mod retry;
pub mod service;

pub use error::{ChatError, Result};
pub use feed::{run_feed, BatchSink, FeedError};
pub use memory::InMemoryMessageRepository;
pub use postgres::PgMessageRepository;
pub use repository::MessageRepository;
pub use retry::{retry_on_conflict, RetryPolicy};
pub use service::{ChatConfig, ChatService};
