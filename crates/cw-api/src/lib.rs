//! Chatwire API
//!
//! HTTP endpoints:
//! - `GET /chat/`: message history and channel list
//! - `POST /chat/send`: post a message as the session's user
//! - `GET /chat/ws`: live subscription over WebSocket
//! - `GET /health`: liveness
//!
//! Chat routes expect the session middleware from `cw-session` to be
//! installed around the router.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use cw_broadcast::SubscriberSet;
use cw_chat::{ChatConfig, ChatService};

pub mod chat;
pub mod error;
pub mod health;
pub mod ws;

pub use error::{ApiError, ApiResult};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    /// Woken on every recorded message.
    pub registry: Arc<SubscriberSet<String>>,
    pub config: Arc<ChatConfig>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat/", get(chat::index))
        .route("/chat/send", post(chat::send))
        .route("/chat/ws", get(ws::ws_handler))
        .route("/health", get(health::health))
        .with_state(state)
}
