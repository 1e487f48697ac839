//! Snapshot and write endpoints

use axum::extract::State;
use axum::http::header::{HeaderName, CACHE_CONTROL, EXPIRES};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Form, Json};
use cw_common::ChatMessage;
use cw_session::CurrentSession;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::AppState;

pub(crate) const USERNAME_KEY: &str = "username";

const NO_CACHE: [(HeaderName, &str); 2] = [(CACHE_CONTROL, "no-cache"), (EXPIRES, "0")];

#[derive(Debug, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
}

/// Everything a client needs to render the chat page.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexResponse {
    pub channels: Vec<Channel>,
    /// Path of the subscription endpoint.
    pub ws: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
pub struct SendForm {
    #[serde(default)]
    pub msg: String,
}

/// GET /chat/
pub async fn index(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> ApiResult<impl IntoResponse> {
    if session.get(USERNAME_KEY).is_none() {
        session.set(USERNAME_KEY, state.config.default_author.clone());
    }

    let messages = state.chat.history().await?;
    let body = IndexResponse {
        channels: vec![Channel {
            name: "general".to_string(),
        }],
        ws: "/chat/ws".to_string(),
        messages,
    };
    Ok((NO_CACHE, Json(body)))
}

/// POST /chat/send
pub async fn send(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Form(form): Form<SendForm>,
) -> ApiResult<impl IntoResponse> {
    let username = session
        .get(USERNAME_KEY)
        .ok_or_else(|| ApiError::bad_request("no username for session"))?;

    state.chat.post(&username, &form.msg).await?;
    Ok((StatusCode::NO_CONTENT, NO_CACHE))
}
