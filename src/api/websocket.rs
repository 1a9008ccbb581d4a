//! WebSocket endpoints
//!
//! Each socket is registered with the broadcast hub and gets a writer task
//! draining its bounded queue. Frames read from the socket go to the inbound
//! router; the socket is dropped from the hub when either side finishes.

use super::handlers::AppState;
use crate::games::PlayerId;
use crate::hub::{player_channel, ConnectionId, GAME_CHANNEL};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// GET /api/ws/crash
pub async fn crash_websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state, None))
}

/// GET /api/ws/user/:user_id
pub async fn user_websocket_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<i64>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state, Some(PlayerId(user_id))))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, player: Option<PlayerId>) {
    let (conn, mut outbound) = state.hub.connect();
    match player {
        Some(player) => {
            // A fresh connection has no identity yet, so binding cannot conflict
            let _ = state.hub.bind_player(conn, player);
            state.hub.register(conn, &player_channel(player));
        }
        None => {
            state.hub.register(conn, GAME_CHANNEL);
        }
    }
    info!(connection_id = %conn, player_id = ?player, "WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => state.router.route_inbound(conn, &text).await,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => state.hub.touch(conn),
                Some(Ok(Message::Binary(_))) => drop_binary(&state, conn),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(connection_id = %conn, error = %e, "WebSocket read failed");
                    break;
                }
            },
            // Queue closed: the hub evicted this connection
            _ = &mut send_task => break,
        }
    }

    send_task.abort();
    state.hub.disconnect(conn);
    info!(connection_id = %conn, "WebSocket client disconnected");
}

fn drop_binary(state: &AppState, conn: ConnectionId) {
    crate::metrics::MetricsRegistry::incr(&state.metrics.malformed_messages);
    warn!(connection_id = %conn, "Dropping binary frame");
}
