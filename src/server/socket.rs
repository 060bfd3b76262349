//! WebSocket session handling.
//!
//! One task per connection reads client frames in order; a companion writer
//! task drains the session's outbound queue into the socket.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use uuid::Uuid;

use super::handlers::AppState;
use crate::hub::{ClientMessage, ServerMessage, Transport};

/// GET /ws - Upgrade to a push-channel session.
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, state))
}

async fn run_session(socket: WebSocket, state: AppState) {
    let session_id = Uuid::new_v4().to_string();
    let mut outbound = state.transport.register(&session_id);
    state.hub.open_session(&session_id);

    let (mut sink, mut stream) = socket.split();

    let writer_session = session_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(session = %writer_session, error = %err, "Failed to encode message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                tracing::debug!(session = %writer_session, "Socket closed while sending");
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_frame(&state, &session_id, &text).await,
            Ok(Message::Binary(_)) => state.transport.send(
                &session_id,
                ServerMessage::error("Binary frames are not supported"),
            ),
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(err) => {
                tracing::debug!(session = %session_id, error = %err, "Socket read failed");
                break;
            }
        }
    }

    let hub = state.hub.clone();
    let closing = session_id.clone();
    if let Err(err) = tokio::task::spawn_blocking(move || hub.close_session(&closing)).await {
        tracing::warn!(session = %session_id, error = %err, "Session cleanup failed");
    }
    state.transport.unregister(&session_id);
    writer.abort();
}

async fn handle_frame(state: &AppState, session_id: &str, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            tracing::debug!(session = session_id, error = %err, "Unparseable client frame");
            state
                .transport
                .send(session_id, ServerMessage::error(format!("Invalid message: {err}")));
            return;
        }
    };

    // Subscribing may block on resource acquisition.
    let hub = state.hub.clone();
    let session = session_id.to_string();
    if let Err(err) = tokio::task::spawn_blocking(move || hub.handle_message(&session, message)).await {
        tracing::warn!(session = session_id, error = %err, "Message handler failed");
    }
}
