//! WebSocket feed of engine events
//!
//! A client gets the current round snapshot on connect, then every
//! [`GameEvent`](crate::games::GameEvent) as a JSON text frame. A client that falls behind the
//! broadcast buffer is resynchronized with a fresh snapshot.

use super::handlers::AppState;
use crate::games::engine::RoundSnapshot;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Frames that are not engine events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    Snapshot { snapshot: RoundSnapshot },
    Error { message: String },
}

/// GET /ws
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let client_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before the snapshot so no event between the two is lost
    let mut events = state.engine.subscribe();

    if send_snapshot(&state, &mut sender).await.is_err() {
        debug!(%client_id, "Client left before the snapshot was sent");
        return;
    }
    info!(%client_id, "WebSocket client connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_json(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%client_id, skipped, "Client lagged; resending snapshot");
                    if send_snapshot(&state, &mut sender).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Closed) => {
                    let _ = send_json(&mut sender, &WsMessage::Error {
                        message: "engine stopped".to_string(),
                    })
                    .await;
                    break;
                }
            },

            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(payload))) => {
                    if sender.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%client_id, error = %e, "WebSocket receive error");
                    break;
                }
            },
        }
    }

    info!(%client_id, "WebSocket client disconnected");
}

type WsSender = futures_util::stream::SplitSink<WebSocket, Message>;

async fn send_snapshot(state: &AppState, sender: &mut WsSender) -> Result<(), ()> {
    match state.engine.snapshot().await {
        Ok(snapshot) => send_json(sender, &WsMessage::Snapshot { snapshot }).await,
        Err(e) => {
            let _ = send_json(sender, &WsMessage::Error { message: e.to_string() }).await;
            Err(())
        }
    }
}

async fn send_json<T: Serialize>(sender: &mut WsSender, value: &T) -> Result<(), ()> {
    let text = match serde_json::to_string(value) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to serialize WebSocket frame");
            return Ok(());
        }
    };
    sender.send(Message::Text(text)).await.map_err(|_| ())
}

