use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::handlers::AppState;
use crate::registry::ConnectionHandle;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub client_id: Option<String>,
    /// Subscribe to this company right after the welcome.
    pub company_id: Option<String>,
}

/// WebSocket upgrade handler for dashboard clients.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

async fn handle_socket(socket: WebSocket, params: ConnectParams, state: AppState) {
    let broadcaster = Arc::clone(&state.broadcaster);
    let (handle, mut outbound) = ConnectionHandle::new(state.client_queue_capacity);
    let id = handle.id();
    let closer = handle.closer();
    let client_id = params
        .client_id
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty());

    let (mut sender, mut receiver) = socket.split();
    if let Err(err) = broadcaster.connect(handle, client_id) {
        error!(connection = %id, error = %err, "failed to register connection");
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: close_code::ERROR,
                reason: "registration failed".into(),
            })))
            .await;
        return;
    }
    if let Some(topic) = params.company_id.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        broadcaster.subscribe(id, topic);
    }

    // Forward queued frames to the socket; send a close frame once the relay lets go.
    let writer_closer = closer.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if sender.send(Message::Text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = writer_closer.cancelled() => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: "relay closing connection".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
        debug!(connection = %id, "writer task ended");
    });

    loop {
        let next = tokio::select! {
            _ = closer.cancelled() => break,
            msg = receiver.next() => msg,
        };
        match next {
            Some(Ok(Message::Text(text))) => broadcaster.handle_client_message(id, &text),
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => broadcaster.handle_client_message(id, text),
                Err(_) => debug!(connection = %id, bytes = data.len(), "ignoring binary frame"),
            },
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(err)) => {
                warn!(connection = %id, error = %err, "websocket receive error");
                break;
            }
        }
    }

    broadcaster.disconnect(id);
    closer.cancel();
    if let Err(err) = writer.await {
        debug!(connection = %id, error = %err, "writer task join failed");
    }
}
