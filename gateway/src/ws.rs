// WebSocket push channel: upgrade, serialized sink, inbound reader.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use trellis_core::registry::{PushSink, SubscriberRegistry};
use trellis_core::types::PushMessage;
use trellis_core::{Result, TrellisError};

use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(rename = "clientId", default)]
    pub client_id: String,
}

/// GET /ws?clientId=...: upgrades to the push channel.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params.client_id, state.registry.clone()))
}

/// Write half of a socket behind the per-connection send mutex.
struct WsSink {
    tx: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl PushSink for WsSink {
    async fn send(&self, message: &PushMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.tx
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| TrellisError::SubscriberWrite(e.to_string()))
    }

    async fn close(&self) {
        let _ = self.tx.lock().await.close().await;
    }
}

async fn handle_socket(socket: WebSocket, client_id: String, registry: SubscriberRegistry) {
    let (tx, mut rx) = socket.split();
    let sink = Arc::new(WsSink { tx: Mutex::new(tx) });
    let subscriber = registry.register(client_id, sink);

    // Reader loop: parse inbound requests until the peer goes away.
    while let Some(received) = rx.next().await {
        let message = match received {
            Ok(message) => message,
            Err(e) => {
                debug!(target: "gateway", subscriber = %subscriber.id, error = %e, "WebSocket read error");
                break;
            }
        };

        match message {
            Message::Text(text) => match serde_json::from_str::<PushMessage>(&text) {
                Ok(request) => registry.handle_request(&subscriber, request).await,
                Err(e) => {
                    warn!(target: "gateway", subscriber = %subscriber.id, error = %e, "Malformed push message");
                    registry.send_error(&subscriber, "invalid message format");
                }
            },
            Message::Close(_) => break,
            // Pings are answered by axum; binary frames are not part of the
            // protocol.
            _ => {}
        }
    }

    registry.unregister(&subscriber.id).await;
}
