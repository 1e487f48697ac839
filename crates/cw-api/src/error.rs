use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cw_chat::ChatError;
use cw_common::ErrorBody;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Chat(e) => {
                error!("Chat store failure: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };
        (status, Json(ErrorBody::new(code, self.to_string()))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
