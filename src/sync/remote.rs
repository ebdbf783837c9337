use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::protocol::{BroadcastHub, Envelope, RelayedIds};

/// Bridge one channel of the local hub to a relay server so tabs running in
/// other processes see the same messages. Returns a handle for the background
/// task managing the connection; aborting it disconnects.
pub async fn connect_relay(url: &str, hub: BroadcastHub, channel: &str) -> Result<JoinHandle<()>> {
    let mut url = Url::parse(url).map_err(|e| anyhow!("invalid relay url: {e}"))?;
    url.query_pairs_mut().append_pair("channel", channel);

    let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    tracing::info!("Connected to relay {}", url);

    // Envelopes delivered from the relay, so the forwarder does not bounce them back
    let relayed = RelayedIds::new();

    // Subscribe before spawning so nothing published meanwhile is missed
    let mut rx = hub.subscribe(channel);

    // local -> relay
    let looped = relayed.clone();
    let forward = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if looped.take(&envelope.id) {
                        continue;
                    }
                    match serde_json::to_string(&*envelope) {
                        Ok(json) => {
                            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                tracing::warn!("Relay connection lost while sending");
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Failed to encode envelope: {}", e),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Relay forwarder lagged, {} messages not relayed", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // relay -> local
    let sender = hub.channel(channel);
    let recv = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(text.as_str()) {
                    Ok(envelope) => {
                        let id = envelope.id;
                        if relayed.insert(id) && sender.send(Arc::new(envelope)).is_err() {
                            relayed.take(&id);
                        }
                    }
                    Err(e) => tracing::warn!("Ignoring malformed relay frame: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Relay connection error: {}", e);
                    break;
                }
            }
        }
    });

    // Join both tasks under a single handle; either side ending tears down the other
    let handle = tokio::spawn(async move {
        let forward_abort = forward.abort_handle();
        let recv_abort = recv.abort_handle();
        tokio::select! {
            _ = forward => recv_abort.abort(),
            _ = recv => forward_abort.abort(),
        }
        tracing::info!("Relay bridge closed");
    });

    Ok(handle)
}
