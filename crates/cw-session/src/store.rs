//! Session persistence
//!
//! [`resolve`] and [`persist`] run against any [`SessionStorage`]; the
//! PostgreSQL implementation is on `PgConnection`, so both accept
//! `&mut *transaction` and take part in the request's transaction.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};

use crate::error::Result;
use crate::session::Session;
use crate::token::SessionToken;

/// Storage operations needed by the session lifecycle.
#[async_trait]
pub trait SessionStorage: Send {
    async fn session_exists(&mut self, token: &SessionToken) -> Result<bool>;

    async fn load_attributes(&mut self, token: &SessionToken) -> Result<HashMap<String, String>>;

    async fn insert_session(&mut self, token: &SessionToken) -> Result<()>;

    /// Insert or overwrite every pair in one round trip.
    async fn upsert_attributes(&mut self, token: &SessionToken, attributes: Vec<(String, String)>) -> Result<()>;
}

/// Outcome of [`resolve`].
#[derive(Debug)]
pub struct Resolved {
    pub session: Session,
    /// A new token was minted and must be handed to the client.
    pub minted: bool,
}

/// Load the session named by `cookie_value`, or mint a fresh one.
///
/// A missing, malformed or unknown token is not an error: the caller simply
/// gets a new session. Store failures are returned.
pub async fn resolve<S: SessionStorage>(
    storage: &mut S,
    cookie_value: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Resolved> {
    if let Some(token) = cookie_value.and_then(SessionToken::decode) {
        if storage.session_exists(&token).await? {
            let original = storage.load_attributes(&token).await?;
            return Ok(Resolved {
                session: Session::existing(token, original),
                minted: false,
            });
        }
        debug!("Session token not found, minting a new one");
    }

    let token = SessionToken::mint(now)?;
    Ok(Resolved {
        session: Session::fresh(token),
        minted: true,
    })
}

/// Write staged values. Returns false without touching the store when nothing
/// was staged.
pub async fn persist<S: SessionStorage>(storage: &mut S, session: &Session) -> Result<bool> {
    if !session.is_dirty() {
        return Ok(false);
    }

    if session.is_new() {
        storage.insert_session(session.token()).await?;
    }

    let attributes = session
        .pending()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    storage.upsert_attributes(session.token(), attributes).await?;
    Ok(true)
}

/// Create the session tables if they do not exist.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    sqlx::query("CREATE TABLE IF NOT EXISTS sessions (token BYTEA PRIMARY KEY)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions_kv (
            token BYTEA REFERENCES sessions,
            key TEXT,
            value TEXT NOT NULL,
            PRIMARY KEY (token, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    info!("Session schema ready");
    Ok(())
}

#[async_trait]
impl SessionStorage for PgConnection {
    async fn session_exists(&mut self, token: &SessionToken) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM sessions WHERE token = $1)")
            .bind(token.as_bytes().as_slice())
            .fetch_one(&mut *self)
            .await?;
        Ok(exists)
    }

    async fn load_attributes(&mut self, token: &SessionToken) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM sessions_kv WHERE token = $1")
            .bind(token.as_bytes().as_slice())
            .fetch_all(&mut *self)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn insert_session(&mut self, token: &SessionToken) -> Result<()> {
        sqlx::query("INSERT INTO sessions (token) VALUES ($1)")
            .bind(token.as_bytes().as_slice())
            .execute(&mut *self)
            .await?;
        Ok(())
    }

    async fn upsert_attributes(&mut self, token: &SessionToken, attributes: Vec<(String, String)>) -> Result<()> {
        let (keys, values): (Vec<String>, Vec<String>) = attributes.into_iter().unzip();

        sqlx::query(
            r#"
            INSERT INTO sessions_kv (token, key, value)
            SELECT $1, kv.key, kv.value FROM UNNEST($2::text[], $3::text[]) AS kv(key, value)
            ON CONFLICT (token, key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(token.as_bytes().as_slice())
        .bind(&keys)
        .bind(&values)
        .execute(&mut *self)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Records every write so tests can check what reached the store.
    #[derive(Default)]
    struct RecordingStorage {
        sessions: HashSet<SessionToken>,
        attributes: HashMap<(SessionToken, String), String>,
        writes: Vec<&'static str>,
    }

    #[async_trait]
    impl SessionStorage for RecordingStorage {
        async fn session_exists(&mut self, token: &SessionToken) -> Result<bool> {
            Ok(self.sessions.contains(token))
        }

        async fn load_attributes(&mut self, token: &SessionToken) -> Result<HashMap<String, String>> {
            Ok(self
                .attributes
                .iter()
                .filter(|((t, _), _)| t == token)
                .map(|((_, k), v)| (k.clone(), v.clone()))
                .collect())
        }

        async fn insert_session(&mut self, token: &SessionToken) -> Result<()> {
            self.writes.push("insert_session");
            self.sessions.insert(*token);
            Ok(())
        }

        async fn upsert_attributes(&mut self, token: &SessionToken, attributes: Vec<(String, String)>) -> Result<()> {
            self.writes.push("upsert_attributes");
            for (k, v) in attributes {
                self.attributes.insert((*token, k), v);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_missing_cookie_mints_fresh_session() {
        let mut storage = RecordingStorage::default();
        let resolved = resolve(&mut storage, None, Utc::now()).await.unwrap();
        assert!(resolved.minted);
        assert!(resolved.session.is_new());
    }

    #[tokio::test]
    async fn test_malformed_cookie_mints_fresh_session() {
        let mut storage = RecordingStorage::default();
        let resolved = resolve(&mut storage, Some("%%%"), Utc::now()).await.unwrap();
        assert!(resolved.minted);
    }

    #[tokio::test]
    async fn test_unknown_token_mints_different_session() {
        let mut storage = RecordingStorage::default();
        let stale = SessionToken::mint(Utc::now()).unwrap();

        let resolved = resolve(&mut storage, Some(&stale.encode()), Utc::now()).await.unwrap();
        assert!(resolved.minted);
        assert_ne!(*resolved.session.token(), stale);
    }

    #[tokio::test]
    async fn test_known_token_loads_snapshot() {
        let mut storage = RecordingStorage::default();
        let token = SessionToken::mint(Utc::now()).unwrap();
        storage.sessions.insert(token);
        storage.attributes.insert((token, "username".to_string()), "robbie".to_string());

        let resolved = resolve(&mut storage, Some(&token.encode()), Utc::now()).await.unwrap();
        assert!(!resolved.minted);
        assert!(!resolved.session.is_new());
        assert_eq!(resolved.session.get("username"), Some("robbie"));
    }

    #[tokio::test]
    async fn test_persist_without_overrides_writes_nothing() {
        let mut storage = RecordingStorage::default();
        let resolved = resolve(&mut storage, None, Utc::now()).await.unwrap();

        assert!(!persist(&mut storage, &resolved.session).await.unwrap());
        assert!(storage.writes.is_empty());
    }

    #[tokio::test]
    async fn test_persist_new_session_inserts_token_first() {
        let mut storage = RecordingStorage::default();
        let mut session = resolve(&mut storage, None, Utc::now()).await.unwrap().session;
        session.set("username", "robbie");

        assert!(persist(&mut storage, &session).await.unwrap());
        assert_eq!(storage.writes, vec!["insert_session", "upsert_attributes"]);
        assert!(storage.sessions.contains(session.token()));
    }

    #[tokio::test]
    async fn test_persist_existing_session_only_upserts() {
        let mut storage = RecordingStorage::default();
        let token = SessionToken::mint(Utc::now()).unwrap();
        storage.sessions.insert(token);
        storage.attributes.insert((token, "username".to_string()), "robbie".to_string());

        let mut session = resolve(&mut storage, Some(&token.encode()), Utc::now())
            .await
            .unwrap()
            .session;
        session.set("username", "alice");
        persist(&mut storage, &session).await.unwrap();

        assert_eq!(storage.writes, vec!["upsert_attributes"]);
        let reloaded = resolve(&mut storage, Some(&token.encode()), Utc::now()).await.unwrap();
        assert_eq!(reloaded.session.get("username"), Some("alice"));
    }
}
