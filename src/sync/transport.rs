use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::protocol::{BroadcastHub, BroadcastMessage, ChannelSender, Envelope};

/// One tab's handle on the shared broadcast channel.
///
/// Best effort in every direction: publishing never blocks or fails, delivery
/// is not guaranteed, and a transport built without a hub behaves as if this
/// tab were the only one.
pub struct BroadcastTransport {
    id: Uuid,
    channel: Option<ChannelSender>,
    closed: AtomicBool,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl BroadcastTransport {
    /// Open `name` on `hub`. `None` means the environment has no broadcast
    /// primitive and yields a disabled transport.
    pub fn connect(hub: Option<&BroadcastHub>, name: &str) -> Self {
        let channel = hub.map(|h| h.channel(name));
        if channel.is_none() {
            tracing::info!("Broadcast unavailable, running as a single context");
        }

        Self {
            id: Uuid::new_v4(),
            channel,
            closed: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::connect(None, "")
    }

    /// Identity used as the envelope origin.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_available(&self) -> bool {
        self.channel.is_some() && !self.closed.load(Ordering::SeqCst)
    }

    /// Fire-and-forget publish to every other tab on the channel.
    pub fn publish(&self, message: BroadcastMessage) {
        let Some(tx) = self.channel.as_ref().filter(|_| self.is_available()) else {
            tracing::debug!("Dropping {} message: transport unavailable", message.kind);
            return;
        };

        let kind = message.kind.clone();
        if tx.send(Arc::new(Envelope::new(self.id, message))).is_err() {
            tracing::debug!("No listeners for {} message", kind);
        }
    }

    /// Invoke `handler` for every message received from other tabs, in
    /// receipt order. Returns `false` when nothing will ever be delivered
    /// (transport unavailable or no async runtime).
    pub fn subscribe<F>(&self, handler: F) -> bool
    where
        F: Fn(BroadcastMessage) + Send + Sync + 'static,
    {
        let Some(tx) = self.channel.as_ref().filter(|_| self.is_available()) else {
            return false;
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("Cannot listen for broadcasts outside a runtime: {}", e);
                return false;
            }
        };

        // Subscribe before spawning so nothing published after this call is missed
        let mut rx = tx.subscribe();
        let me = self.id;

        let task = runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if envelope.origin != me {
                            handler(envelope.message.clone());
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Broadcast listener lagged, {} messages lost", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        self.listeners.lock().push(task);
        true
    }

    /// Stop listening and publishing. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for task in self.listeners.lock().drain(..) {
            task.abort();
        }
        tracing::debug!("Broadcast transport {} closed", self.id);
    }
}

impl Drop for BroadcastTransport {
    fn drop(&mut self) {
        self.close();
    }
}
