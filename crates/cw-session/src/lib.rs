//! Chatwire sessions
//!
//! Small per-client key/value state keyed by a 256-bit token carried in a
//! cookie. Each request resolves its session inside a transaction, handlers
//! stage changes, and staged changes are written back in the same transaction.

pub mod error;
pub mod middleware;
pub mod session;
pub mod store;
pub mod token;

pub use error::{Result, SessionError};
pub use middleware::{
    session_cookie, session_middleware, CurrentSession, SessionConfig, SessionHandle, SessionLayerState,
};
pub use session::Session;
pub use store::{init_schema, persist, resolve, Resolved, SessionStorage};
pub use token::{SessionToken, TOKEN_LEN};
