//! Chatwire Server
//!
//! Serves the chat API, keeps one PostgreSQL `LISTEN` connection open to wake
//! subscribers, and shuts down in order on SIGINT/SIGTERM or when that
//! connection is lost.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `CW_LISTEN_ADDR` | `0.0.0.0:9000` | HTTP listen address |
//! | `CW_DATABASE_URL` | `postgres://postgres@localhost:5432/postgres?sslmode=disable` | PostgreSQL URL |
//! | `CW_DB_MAX_CONNECTIONS` | `10` | Pool size, at least 2 (a post holds two connections) |
//! | `CW_DB_ACQUIRE_TIMEOUT_SECS` | `10` | Wait for a pooled connection |
//! | `CW_NOTIFY_CHANNEL` | `messages` | Notification channel |
//! | `CW_COOKIE_NAME` | `session` | Session cookie name |
//! | `CW_COOKIE_SECURE` | `false` | Mark the session cookie `Secure` |
//! | `CW_DEFAULT_AUTHOR` | `robbie` | Author name for new sessions |
//! | `CW_WRITE_MAX_ATTEMPTS` | unbounded | Attempts per message write |
//! | `CW_WRITE_RETRY_BACKOFF_MS` | `0` | Pause between conflicting attempts |
//! | `CW_LOG_JSON` | `false` | JSON log output |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use cw_api::AppState;
use cw_broadcast::SubscriberSet;
use cw_chat::{ChatConfig, ChatService, PgMessageRepository, RetryPolicy};
use cw_notify::{BridgeConfig, NotificationBridge, PgNotificationSource};
use cw_session::{session_middleware, SessionConfig, SessionLayerState};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Chatwire Server
#[derive(Parser, Debug)]
#[command(name = "cw-server")]
#[command(about = "Chatwire - session-aware chat backed by PostgreSQL", version)]
struct Args {
    /// HTTP listen address
    #[arg(long, env = "CW_LISTEN_ADDR", default_value = "0.0.0.0:9000")]
    listen_addr: SocketAddr,

    /// PostgreSQL connection URL
    #[arg(
        long,
        env = "CW_DATABASE_URL",
        default_value = "postgres://postgres@localhost:5432/postgres?sslmode=disable"
    )]
    database_url: String,

    /// Maximum pooled database connections.
    ///
    /// Every request holds one connection for its session transaction, and
    /// `POST /chat/send` takes a second for the message write while the first
    /// is still open. Size the pool for about two per concurrent post. The
    /// notification listener detaches its connection and does not count.
    #[arg(
        long,
        env = "CW_DB_MAX_CONNECTIONS",
        default_value = "10",
        value_parser = clap::value_parser!(u32).range(2..)
    )]
    max_connections: u32,

    /// Seconds to wait for a pooled connection before failing the request
    #[arg(long, env = "CW_DB_ACQUIRE_TIMEOUT_SECS", default_value = "10")]
    db_acquire_timeout_secs: u64,

    /// Channel used to signal new messages
    #[arg(long, env = "CW_NOTIFY_CHANNEL", default_value = "messages")]
    notify_channel: String,

    /// Session cookie name
    #[arg(long, env = "CW_COOKIE_NAME", default_value = "session")]
    cookie_name: String,

    /// Only send the session cookie over HTTPS
    #[arg(long, env = "CW_COOKIE_SECURE", default_value = "false")]
    cookie_secure: bool,

    /// Author name given to new sessions
    #[arg(long, env = "CW_DEFAULT_AUTHOR", default_value = "robbie")]
    default_author: String,

    /// Attempts per message write when writers conflict (unbounded if unset)
    #[arg(long, env = "CW_WRITE_MAX_ATTEMPTS")]
    write_max_attempts: Option<u32>,

    /// Pause between conflicting write attempts in milliseconds
    #[arg(long, env = "CW_WRITE_RETRY_BACKOFF_MS", default_value = "0")]
    write_retry_backoff_ms: u64,

    /// Emit logs as JSON
    #[arg(long, env = "CW_LOG_JSON", default_value = "false")]
    log_json: bool,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            cookie_name: self.cookie_name.clone(),
            cookie_secure: self.cookie_secure,
        }
    }

    fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            default_author: self.default_author.clone(),
            retry: RetryPolicy {
                max_attempts: self.write_max_attempts,
                backoff: Duration::from_millis(self.write_retry_backoff_ms),
            },
        }
    }

    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_secs(self.db_acquire_timeout_secs))
    }

    fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            channel: self.notify_channel.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    cw_common::logging::init(args.log_json);

    info!("Starting Chatwire server");

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    let pool = args
        .pool_options()
        .connect(&args.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    info!("Connected to PostgreSQL");

    cw_session::init_schema(&pool).await?;
    let repository = PgMessageRepository::new(pool.clone(), args.notify_channel.clone());
    repository.init_schema().await?;

    // Setup shutdown signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let registry = Arc::new(SubscriberSet::<String>::new());

    // Notification bridge; losing it takes the whole process down
    let source = PgNotificationSource::connect(&pool, &args.bridge_config()).await?;
    let mut bridge_failed = shutdown_tx.subscribe();
    let bridge_handle = {
        let bridge = NotificationBridge::new(source, registry.clone());
        let shutdown_rx = shutdown_tx.subscribe();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge.run(shutdown_rx).await {
                error!("Notification bridge lost, shutting down: {:#}", e);
                let _ = shutdown_tx.send(());
            }
        })
    };

    let chat_config = args.chat_config();
    let state = AppState {
        chat: ChatService::new(Arc::new(repository), chat_config.retry.clone()),
        registry: registry.clone(),
        config: Arc::new(chat_config),
    };
    let session_state = SessionLayerState::new(pool.clone(), args.session_config());

    let app = cw_api::router(state)
        .route("/metrics", get(move || std::future::ready(metrics.render())))
        .layer(axum::middleware::from_fn_with_state(session_state, session_middleware))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(args.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen_addr))?;
    info!("Chatwire listening on http://{}", args.listen_addr);

    let server_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            });
            if let Err(e) = server.await {
                error!("HTTP server error: {}", e);
            }
        })
    };

    info!("Press Ctrl+C to shutdown");

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received, initiating graceful shutdown..."),
        _ = bridge_failed.recv() => info!("Shutting down after notification bridge failure..."),
    }

    let _ = shutdown_tx.send(());

    let finished = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        registry.close_all().await;
        let _ = server_handle.await;
        let _ = bridge_handle.await;
    })
    .await;
    if finished.is_err() {
        error!("Shutdown did not finish within {:?}", SHUTDOWN_TIMEOUT);
    }

    pool.close().await;
    info!("Chatwire server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
