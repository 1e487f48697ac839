//! Session middleware against a live PostgreSQL
//!
//! Run with `DATABASE_URL=postgres://... cargo test -p cw-session -- --ignored`.

use axum::body::{to_bytes, Body};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{Request, Response, StatusCode};
use axum::routing::get;
use axum::{middleware, Router};
use cw_session::{init_schema, session_middleware, CurrentSession, SessionConfig, SessionLayerState, SessionToken};
use sqlx::PgPool;
use tower::ServiceExt;

async fn pool() -> PgPool {
    let url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://postgres@localhost:5432/postgres?sslmode=disable".to_string());
    let pool = PgPool::connect(&url).await.expect("Failed to connect to PostgreSQL");
    init_schema(&pool).await.expect("Failed to create session schema");
    pool
}

fn app(pool: PgPool) -> Router {
    async fn remember(CurrentSession(session): CurrentSession) -> &'static str {
        session.set("username", "alice");
        "ok"
    }

    async fn whoami(CurrentSession(session): CurrentSession) -> String {
        session.get("username").unwrap_or_default()
    }

    async fn fail_after_set(CurrentSession(session): CurrentSession) -> StatusCode {
        session.set("username", "mallory");
        StatusCode::INTERNAL_SERVER_ERROR
    }

    Router::new()
        .route("/remember", get(remember))
        .route("/whoami", get(whoami))
        .route("/fail", get(fail_after_set))
        .layer(middleware::from_fn_with_state(
            SessionLayerState::new(pool, SessionConfig::default()),
            session_middleware,
        ))
}

fn request(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(COOKIE, cookie);
    }
    builder.body(Body::empty()).unwrap()
}

/// `name=value` part of the response's Set-Cookie header, if any.
fn issued_cookie(response: &Response<Body>) -> Option<String> {
    let header = response.headers().get(SET_COOKIE)?.to_str().ok()?;
    header.split(';').next().map(str::to_string)
}

fn token_of(cookie: &str) -> SessionToken {
    let value = cookie.trim_start_matches("session=");
    SessionToken::decode(value).expect("cookie carries a valid token")
}

async fn token_exists(pool: &PgPool, token: &SessionToken) -> bool {
    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM sessions WHERE token = $1)")
        .bind(token.as_bytes().as_slice())
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_session_survives_across_requests() {
    let pool = pool().await;
    let app = app(pool.clone());

    let first = app.clone().oneshot(request("/remember", None)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let cookie = issued_cookie(&first).expect("new session issues a cookie");
    assert!(token_exists(&pool, &token_of(&cookie)).await);

    let second = app.oneshot(request("/whoami", Some(&cookie))).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert!(issued_cookie(&second).is_none(), "known token is not re-issued");
    let body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"alice");
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_untouched_session_is_not_stored() {
    let pool = pool().await;
    let app = app(pool.clone());

    let response = app.oneshot(request("/whoami", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = issued_cookie(&response).expect("new session issues a cookie");
    assert!(!token_exists(&pool, &token_of(&cookie)).await);
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_cookie_issued_even_when_transaction_rolls_back() {
    // Inherited behaviour, kept visible here rather than fixed: the client is
    // handed a token that was never stored, and its next request is silently
    // given a different session.
    let pool = pool().await;
    let app = app(pool.clone());

    let failed = app.clone().oneshot(request("/fail", None)).await.unwrap();
    assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let orphan = issued_cookie(&failed).expect("cookie is issued despite rollback");
    assert!(!token_exists(&pool, &token_of(&orphan)).await);

    let retry = app.oneshot(request("/remember", Some(&orphan))).await.unwrap();
    assert_eq!(retry.status(), StatusCode::OK);
    let replacement = issued_cookie(&retry).expect("unknown token is replaced");
    assert_ne!(token_of(&replacement), token_of(&orphan));
    assert!(token_exists(&pool, &token_of(&replacement)).await);
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_overwrite_existing_attribute() {
    let pool = pool().await;
    let app = app(pool.clone());

    let first = app.clone().oneshot(request("/remember", None)).await.unwrap();
    let cookie = issued_cookie(&first).unwrap();
    let token = token_of(&cookie);

    sqlx::query("UPDATE sessions_kv SET value = 'bob' WHERE token = $1 AND key = 'username'")
        .bind(token.as_bytes().as_slice())
        .execute(&pool)
        .await
        .unwrap();

    app.clone().oneshot(request("/remember", Some(&cookie))).await.unwrap();

    let value: String = sqlx::query_scalar("SELECT value FROM sessions_kv WHERE token = $1 AND key = 'username'")
        .bind(token.as_bytes().as_slice())
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(value, "alice");
}
