//! Subscription endpoint
//!
//! The client opens the socket and sends one `{"after": "<id>"}` message. The
//! server then pushes `{"messages": [...]}` text frames for everything after
//! that cursor, first as a replay and then live. Anything the client sends
//! afterwards is ignored and only used to notice that it went away. A failed
//! read or push closes the socket with code 1011 and the error text.

use std::borrow::Cow;

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use cw_chat::{run_feed, BatchSink};
use cw_common::{ChatMessage, Cursor};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::AppState;

/// Close reasons must fit in a control frame.
const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug, Default, Deserialize)]
struct SubscribeRequest {
    #[serde(default)]
    after: Option<Value>,
}

impl SubscribeRequest {
    fn cursor(&self) -> Cursor {
        match &self.after {
            Some(Value::String(raw)) => Cursor::parse(raw),
            Some(Value::Number(n)) => Cursor::parse(&n.to_string()),
            _ => Cursor::BEGINNING,
        }
    }
}

#[derive(Serialize)]
struct BatchFrame<'a> {
    messages: &'a [ChatMessage],
}

pub(crate) fn encode_batch(batch: &[ChatMessage]) -> serde_json::Result<String> {
    serde_json::to_string(&BatchFrame { messages: batch })
}

struct WsSink {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl BatchSink for WsSink {
    async fn push(&mut self, batch: &[ChatMessage]) -> anyhow::Result<()> {
        let frame = encode_batch(batch)?;
        self.sender.send(Message::Text(frame)).await?;
        Ok(())
    }
}

/// GET /chat/ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (sender, mut receiver) = socket.split();
    let mut sink = WsSink { sender };

    let Some(cursor) = read_subscribe(&mut receiver).await else {
        let _ = sink.sender.send(Message::Close(None)).await;
        return;
    };

    // Register before the first replay so nothing written in between is missed.
    let subscription = state.registry.subscribe().await;
    let id = subscription.id();
    info!("[{}] Subscriber connected, replaying after {:?}", id, cursor.position());

    let reader = {
        let registry = state.registry.clone();
        tokio::spawn(async move {
            while let Some(Ok(message)) = receiver.next().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
            }
            registry.unsubscribe(id).await;
        })
    };

    // The feed consumes the subscription, so its endpoint is already dropped
    // when we unsubscribe and cannot stall a pending fan-out.
    let repository = state.chat.repository();
    match run_feed(repository.as_ref(), cursor, subscription, &mut sink).await {
        Ok(_) => {
            let _ = sink.sender.send(Message::Close(None)).await;
        }
        Err(e) => {
            warn!("[{}] Subscription failed: {}", id, e);
            let frame = CloseFrame {
                code: close_code::ERROR,
                reason: Cow::Owned(close_reason(&e.to_string())),
            };
            let _ = sink.sender.send(Message::Close(Some(frame))).await;
        }
    }

    state.registry.unsubscribe(id).await;
    reader.abort();
    info!("[{}] Subscriber disconnected", id);
}

/// Wait for the client's opening message. `None` if the client left or sent
/// something that is not a subscribe request.
async fn read_subscribe(receiver: &mut SplitStream<WebSocket>) -> Option<Cursor> {
    loop {
        let request: serde_json::Result<SubscribeRequest> = match receiver.next().await? {
            Ok(Message::Text(text)) => serde_json::from_str(&text),
            Ok(Message::Binary(bytes)) => serde_json::from_slice(&bytes),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return None,
            Err(e) => {
                debug!("WebSocket read failed before subscribing: {}", e);
                return None;
            }
        };

        return match request {
            Ok(request) => Some(request.cursor()),
            Err(e) => {
                debug!("Invalid subscribe message: {}", e);
                None
            }
        };
    }
}

fn close_reason(text: &str) -> String {
    if text.len() <= MAX_CLOSE_REASON {
        return text.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
