use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::config::DEFAULT_CHANNEL;
use crate::sync::protocol::RelayedIds;
use crate::sync::{BroadcastHub, Envelope};

#[derive(Clone, Default)]
pub struct AppState {
    pub hub: BroadcastHub,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "tabsync relay" }))
        .route("/health", get(|| async { Json("OK") }))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("Relay listening on http://{}", addr);

    axum::serve(listener, router(AppState::default())).await?;
    Ok(())
}

#[derive(Deserialize)]
struct WsQuery {
    channel: Option<String>,
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl axum::response::IntoResponse {
    let channel = query
        .channel
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_CHANNEL.to_string());
    ws.on_upgrade(move |socket| handle_ws(state, channel, socket))
}

async fn handle_ws(state: AppState, channel: String, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let peer = Uuid::new_v4();
    tracing::debug!("Relay peer {} joined channel {}", peer, channel);

    // Envelopes this peer sent us; never echoed back to it
    let from_peer = RelayedIds::new();

    // Forward channel traffic to this peer
    let mut rx = state.hub.subscribe(&channel);
    let own = from_peer.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if own.take(&envelope.id) {
                        continue;
                    }
                    if let Ok(text) = serde_json::to_string(&*envelope) {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Relay peer lagged, {} messages dropped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Receive from this peer and publish to everyone on the channel
    let tx = state.hub.channel(&channel);
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(text.as_str()) {
                    Ok(envelope) => {
                        let id = envelope.id;
                        if from_peer.insert(id) && tx.send(Arc::new(envelope)).is_err() {
                            from_peer.take(&id);
                        }
                    }
                    Err(e) => tracing::warn!("Relay peer sent malformed frame: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    tracing::debug!("Relay peer {} left channel {}", peer, channel);
}
