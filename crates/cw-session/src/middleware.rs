//! Request-scoped sessions for axum
//!
//! [`session_middleware`] opens one transaction per request, resolves the
//! session inside it, runs the handler, then persists staged values and
//! commits. Handlers reach the session through the [`CurrentSession`]
//! extractor.
//!
//! The transaction commits only when the handler answered with a 1xx, 2xx or
//! 3xx status; anything else rolls it back and drops staged values. A minted
//! token is sent as `Set-Cookie` either way, so a client whose first request
//! failed holds a token with no row behind it and gets a different session on
//! its next request.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::SET_COOKIE;
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use cw_common::ErrorBody;
use parking_lot::Mutex;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, error, warn};

use crate::session::Session;
use crate::store;
use crate::token::SessionToken;

/// Cookie settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub cookie_name: String,
    pub cookie_secure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "session".to_string(),
            cookie_secure: false,
        }
    }
}

/// State for [`session_middleware`].
#[derive(Clone)]
pub struct SessionLayerState {
    pool: PgPool,
    config: Arc<SessionConfig>,
}

impl SessionLayerState {
    pub fn new(pool: PgPool, config: SessionConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
        }
    }
}

/// Shared handle to the current request's session.
#[derive(Debug, Clone)]
pub struct SessionHandle(Arc<Mutex<Session>>);

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.0.lock().get(key).map(str::to_string)
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.0.lock().set(key, value);
    }

    pub fn snapshot(&self) -> Session {
        self.0.lock().clone()
    }
}

/// Extractor for the session installed by [`session_middleware`].
pub struct CurrentSession(pub SessionHandle);

#[axum::async_trait]
impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SessionHandle>()
            .cloned()
            .map(CurrentSession)
            .ok_or_else(|| internal_error("Session middleware is not installed"))
    }
}

/// Build the cookie that hands `token` to the client.
pub fn session_cookie(config: &SessionConfig, token: &SessionToken) -> Cookie<'static> {
    Cookie::build((config.cookie_name.clone(), token.encode()))
        .path("/")
        .same_site(SameSite::Strict)
        .http_only(true)
        .secure(config.cookie_secure)
        .build()
}

pub async fn session_middleware(
    State(state): State<SessionLayerState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let mut tx = match state.pool.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            error!("Failed to begin session transaction: {}", e);
            return internal_error(e.to_string());
        }
    };

    let cookie_value = jar.get(&state.config.cookie_name).map(|c| c.value().to_string());
    let resolved = match store::resolve(&mut *tx, cookie_value.as_deref(), Utc::now()).await {
        Ok(resolved) => resolved,
        Err(e) => {
            error!("Failed to resolve session: {}", e);
            return internal_error(e.to_string());
        }
    };

    let minted = resolved.minted.then(|| *resolved.session.token());
    let handle = SessionHandle::new(resolved.session);
    request.extensions_mut().insert(handle.clone());

    let mut response = next.run(request).await;

    if let Some(token) = minted {
        let cookie = session_cookie(&state.config, &token);
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(e) => warn!("Session cookie is not a valid header value: {}", e),
        }
    }

    finish(tx, &handle, response.status()).await;
    response
}

async fn finish(mut tx: Transaction<'static, Postgres>, handle: &SessionHandle, status: StatusCode) {
    if !(status.is_informational() || status.is_success() || status.is_redirection()) {
        debug!("Handler answered {}, rolling back session transaction", status);
        if let Err(e) = tx.rollback().await {
            warn!("Session rollback failed: {}", e);
        }
        return;
    }

    let session = handle.snapshot();
    if let Err(e) = store::persist(&mut *tx, &session).await {
        error!("Failed to persist session: {}", e);
        return;
    }

    if let Err(e) = tx.commit().await {
        error!("Failed to commit session transaction: {}", e);
    }
}

fn internal_error(message: impl Into<String>) -> Response {
    let body = ErrorBody::new("INTERNAL_ERROR", message);
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    #[test]
    fn test_session_cookie_attributes() {
        let token = SessionToken::mint(Utc::now()).unwrap();
        let cookie = session_cookie(&SessionConfig::default(), &token);

        assert_eq!(cookie.name(), "session");
        assert_eq!(cookie.value(), token.encode());
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.same_site(), Some(SameSite::Strict));
        assert_eq!(cookie.http_only(), Some(true));

        let header = cookie.to_string();
        assert!(header.contains("HttpOnly"));
        assert!(header.contains("SameSite=Strict"));
        assert!(!header.contains("Secure"));
    }

    #[test]
    fn test_secure_flag_follows_config() {
        let token = SessionToken::mint(Utc::now()).unwrap();
        let config = SessionConfig {
            cookie_name: "cw".to_string(),
            cookie_secure: true,
        };
        let cookie = session_cookie(&config, &token);
        assert_eq!(cookie.name(), "cw");
        assert_eq!(cookie.secure(), Some(true));
    }

    #[test]
    fn test_handle_reads_staged_values() {
        let handle = SessionHandle::new(Session::fresh(SessionToken::mint(Utc::now()).unwrap()));
        handle.set("username", "robbie");

        let shared = handle.clone();
        assert_eq!(shared.get("username"), Some("robbie".to_string()));
        assert!(handle.snapshot().is_dirty());
    }

    #[tokio::test]
    async fn test_extractor_without_middleware_is_internal_error() {
        async fn handler(CurrentSession(_session): CurrentSession) -> &'static str {
            "unreachable"
        }

        let app = Router::new().route("/", get(handler));
        let response = app
            .oneshot(axum::http::Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
