//! Session error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Random source unavailable: {0}")]
    Random(#[from] rand::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
