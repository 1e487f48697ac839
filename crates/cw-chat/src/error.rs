use cw_common::{Snowflake, SnowflakeError};
use thiserror::Error;

/// PostgreSQL `serialization_failure`.
const SERIALIZATION_FAILURE: &str = "40001";

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Identifier error: {0}")]
    Identifier(#[from] SnowflakeError),

    #[error("Write conflict: identifier {0} was taken by a concurrent writer")]
    Conflict(Snowflake),
}

impl ChatError {
    /// True when the write transaction lost a race with a concurrent writer
    /// and may be retried from the start.
    ///
    /// Under serializable isolation PostgreSQL can report the failure from any
    /// statement in the transaction, not only from `COMMIT`.
    pub fn is_conflict(&self) -> bool {
        match self {
            ChatError::Conflict(_) => true,
            ChatError::Database(e) => e
                .as_database_error()
                .and_then(|db| db.code())
                .as_deref()
                == Some(SERIALIZATION_FAILURE),
            ChatError::Identifier(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
