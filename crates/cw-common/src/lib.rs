//! Chatwire common types
//!
//! - [`Snowflake`]: time-ordered identifiers used as primary keys and sync cursors
//! - [`ChatMessage`]: the immutable fact recorded by the write path
//! - [`Cursor`]: a subscriber's exclusive high-water mark
//! - [`ErrorBody`]: JSON body returned by failing HTTP handlers

use serde::{Deserialize, Serialize};

pub mod logging;
pub mod snowflake;

pub use snowflake::{Snowflake, SnowflakeError, EPOCH_MS, SEQUENCE_BITS};

// ============================================================================
// Messages
// ============================================================================

/// A recorded chat message. Created once by the write path, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Snowflake,
    pub author: String,
    pub text: String,
}

// ============================================================================
// Replay Cursor
// ============================================================================

/// Exclusive lower bound for incremental reads.
///
/// `Cursor::default()` sits before the first message. A cursor only ever moves
/// forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor(Option<Snowflake>);

impl Cursor {
    pub const BEGINNING: Cursor = Cursor(None);

    pub fn after(id: Snowflake) -> Self {
        Cursor(Some(id))
    }

    /// Parse a client-supplied cursor. Anything that is not a non-negative
    /// decimal integer means "from the beginning".
    pub fn parse(raw: &str) -> Self {
        raw.parse::<Snowflake>().map(Cursor::after).unwrap_or_default()
    }

    pub fn position(self) -> Option<Snowflake> {
        self.0
    }

    /// Value to compare with `id > $1` in store queries.
    pub fn lower_bound(self) -> i64 {
        self.0.map_or(-1, Snowflake::raw)
    }

    /// Move past every message in `batch`. Never moves backwards.
    pub fn advance(&mut self, batch: &[ChatMessage]) {
        if let Some(max) = batch.iter().map(|m| m.id).max() {
            if self.0.map_or(true, |current| max > current) {
                self.0 = Some(max);
            }
        }
    }
}

// ============================================================================
// HTTP Error Body
// ============================================================================

/// Standard error response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}
