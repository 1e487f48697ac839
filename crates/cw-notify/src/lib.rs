//! Notification Bridge
//!
//! One long-lived task listens on the database notification channel and wakes
//! every registered subscriber on each signal. Losing the listen connection
//! ends the bridge with an error; the process treats that as fatal, since no
//! subscriber would learn of new messages otherwise.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use cw_broadcast::SubscriberSet;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

/// Bridge settings
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Notification channel written by the message store.
    pub channel: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel: "messages".to_string(),
        }
    }
}

/// A stream of change notifications.
#[async_trait]
pub trait NotificationSource: Send {
    /// Wait for the next notification and return its payload. An error means
    /// the source is gone for good.
    async fn next_payload(&mut self) -> Result<String>;
}

/// `LISTEN` on a dedicated PostgreSQL connection.
pub struct PgNotificationSource {
    listener: PgListener,
    channel: String,
}

impl PgNotificationSource {
    pub async fn connect(pool: &PgPool, config: &BridgeConfig) -> Result<Self> {
        let mut listener = PgListener::connect_with(pool)
            .await
            .context("Failed to open notification connection")?;
        listener
            .listen(&config.channel)
            .await
            .with_context(|| format!("Failed to LISTEN on channel '{}'", config.channel))?;

        info!("Listening for notifications on channel '{}'", config.channel);
        Ok(Self {
            listener,
            channel: config.channel.clone(),
        })
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn next_payload(&mut self) -> Result<String> {
        // None means the connection dropped; recv() would reconnect silently.
        match self.listener.try_recv().await? {
            Some(notification) => Ok(notification.payload().to_string()),
            None => bail!("Notification connection for channel '{}' was lost", self.channel),
        }
    }
}

/// In-process source fed through a channel.
pub struct ChannelSource(mpsc::UnboundedReceiver<String>);

impl ChannelSource {
    pub fn new(receiver: mpsc::UnboundedReceiver<String>) -> Self {
        Self(receiver)
    }
}

#[async_trait]
impl NotificationSource for ChannelSource {
    async fn next_payload(&mut self) -> Result<String> {
        match self.0.recv().await {
            Some(payload) => Ok(payload),
            None => bail!("Notification channel closed"),
        }
    }
}

pub struct NotificationBridge<S> {
    source: S,
    registry: Arc<SubscriberSet<String>>,
}

impl<S: NotificationSource> NotificationBridge<S> {
    pub fn new(source: S, registry: Arc<SubscriberSet<String>>) -> Self {
        Self { source, registry }
    }

    /// Forward notifications until `shutdown` fires (`Ok`) or the source fails
    /// (`Err`).
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!("Notification bridge started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Notification bridge shutting down");
                    return Ok(());
                }
                next = self.source.next_payload() => {
                    let payload = match next {
                        Ok(payload) => payload,
                        Err(e) => {
                            error!("Notification bridge failed: {:#}", e);
                            return Err(e);
                        }
                    };
                    metrics::counter!("chatwire_notifications_total").increment(1);
                    let delivered = self.registry.send(payload.clone()).await;
                    debug!("Notification {} woke {} subscribers", payload, delivered);
                }
            }
        }
    }
}
