use axum::{
    extract::{
        State,
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::stream::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::server::update_service::ServerListPush;
use crate::web::AppState;

/// Live inventory feed for the dashboard.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state))
}

async fn send_push(socket: &mut WebSocket, push: &ServerListPush) -> bool {
    match serde_json::to_string(push) {
        Ok(json_data) => socket
            .send(Message::Text(Utf8Bytes::from(json_data)))
            .await
            .is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize server list.");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, app_state: Arc<AppState>) {
    // Subscribe before the snapshot so no change slips in between.
    let mut rx = app_state.server_list_tx.subscribe();

    let initial = ServerListPush {
        servers: app_state.store.list(),
    };
    if !send_push(&mut socket, &initial).await {
        debug!("Client left before the initial snapshot was sent.");
        return;
    }
    info!("Dashboard WebSocket session started.");

    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Ok(push) => {
                    if !send_push(&mut socket, &push).await {
                        debug!("Error sending server list update. Closing session.");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // The next push carries the full list anyway.
                    debug!(skipped, "WebSocket session lagged behind updates.");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.next() => match incoming {
                Some(Ok(Message::Text(t))) if t.as_str() == "ping" => {
                    if socket.send(Message::Text(Utf8Bytes::from("pong"))).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(p))) => {
                    if socket.send(Message::Pong(p)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Client closed the WebSocket session.");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket receive error.");
                    break;
                }
            },
        }
    }
    info!("Dashboard WebSocket session ended.");
}
