use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::http_api::ApiState;
use crate::terminal_bridge::TerminalBridge;

/// Ping interval used to detect half-open TCP connections.
const WS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// GET /ws/terminal: one terminal connection per socket.
pub async fn terminal_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    let bridge = state.bridge.clone();
    ws.on_upgrade(move |socket| handle_terminal_ws(socket, bridge))
}

async fn handle_terminal_ws(socket: WebSocket, bridge: Arc<TerminalBridge>) {
    let (ws_sender, mut ws_receiver) = socket.split();
    // Shared by the event forwarder and the heartbeat.
    let ws_sender = Arc::new(tokio::sync::Mutex::new(ws_sender));

    let connection = Arc::new(bridge.connect());
    let connection_id = connection.id();
    info!(%connection_id, "terminal WebSocket connected");

    // Task: bridge events -> WS
    let events = connection.events();
    let sender = ws_sender.clone();
    let mut events_task = tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to encode terminal event: {e}");
                    continue;
                }
            };
            if sender
                .lock()
                .await
                .send(Message::Text(text.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Task: WS -> bridge
    let inbound = connection.clone();
    let mut inbound_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => inbound.handle_text(text.as_str()),
                Ok(Message::Binary(data)) => inbound.input(&data),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("terminal WebSocket receive error: {e}");
                    break;
                }
            }
        }
    });

    // Task: heartbeat. Pongs are answered by the WebSocket layer.
    let sender = ws_sender.clone();
    let mut heartbeat_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(WS_HEARTBEAT_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            if sender
                .lock()
                .await
                .send(Message::Ping(Vec::new().into()))
                .await
                .is_err()
            {
                debug!("heartbeat ping failed, connection lost");
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut events_task => {},
        _ = &mut inbound_task => {},
        _ = &mut heartbeat_task => {},
    }
    events_task.abort();
    inbound_task.abort();
    heartbeat_task.abort();

    connection.close();
    info!(%connection_id, "terminal WebSocket disconnected");
}
