use async_trait::async_trait;
use chrono::Utc;
use cw_common::{ChatMessage, Cursor, Snowflake};
use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::Result;
use crate::repository::MessageRepository;

pub struct PgMessageRepository {
    pool: PgPool,
    channel: String,
}

impl PgMessageRepository {
    /// `channel` is the notification channel signalled on every insert.
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id BIGINT PRIMARY KEY,
                username TEXT NOT NULL,
                msg TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Message schema ready");
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn append_once(&self, author: &str, text: &str) -> Result<ChatMessage> {
        // Dropping the transaction on any early return rolls it back.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let latest: Option<i64> = sqlx::query_scalar("SELECT max(id) FROM messages")
            .fetch_one(&mut *tx)
            .await?;
        let latest = latest.map(Snowflake::from_raw).transpose()?;
        let id = Snowflake::next(latest, Utc::now())?;

        sqlx::query("INSERT INTO messages (id, username, msg) VALUES ($1, $2, $3)")
            .bind(id.raw())
            .bind(author)
            .bind(text)
            .execute(&mut *tx)
            .await?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!("[{}] Message recorded", id);

        Ok(ChatMessage {
            id,
            author: author.to_string(),
            text: text.to_string(),
        })
    }

    async fn messages_after(&self, cursor: Cursor) -> Result<Vec<ChatMessage>> {
        let rows: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT id, username, msg FROM messages WHERE id > $1 ORDER BY id")
                .bind(cursor.lower_bound())
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(id, author, text)| -> Result<ChatMessage> {
                Ok(ChatMessage {
                    id: Snowflake::from_raw(id)?,
                    author,
                    text,
                })
            })
            .collect()
    }
}
