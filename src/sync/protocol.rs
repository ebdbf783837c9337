//! Broadcast protocol: message schema, transit envelope, and the in-process
//! hub of named channels every tab of one application publishes into.

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::clock::Timestamp;

/// Capacity of each named channel before slow listeners start lagging.
const CHANNEL_CAPACITY: usize = 256;

/// Bound on envelopes a bridge remembers as injected but not yet looped back.
const RELAYED_CAPACITY: usize = 1024;

/// Kind of a broadcast message. Unknown kinds travel verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    SessionRefresh,
    LastFetchUpdate,
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::SessionRefresh => "session_refresh",
            MessageKind::LastFetchUpdate => "last_fetch_update",
            MessageKind::Other(s) => s,
        }
    }
}

impl From<&str> for MessageKind {
    fn from(s: &str) -> Self {
        match s {
            "session_refresh" => MessageKind::SessionRefresh,
            "last_fetch_update" => MessageKind::LastFetchUpdate,
            other => MessageKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(MessageKind::from(s.as_str()))
    }
}

/// Timestamped event exchanged between tabs: `{ type, data, timestamp }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: Timestamp,
}

impl BroadcastMessage {
    pub fn new(kind: MessageKind, data: serde_json::Value, timestamp: Timestamp) -> Self {
        Self {
            kind,
            data,
            timestamp,
        }
    }
}

/// Transit wrapper. `origin` identifies the sending transport so it never
/// hears itself; `id` lets relays drop duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub origin: Uuid,
    pub message: BroadcastMessage,
}

impl Envelope {
    pub fn new(origin: Uuid, message: BroadcastMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
            message,
        }
    }
}

pub type ChannelSender = broadcast::Sender<Arc<Envelope>>;
pub type ChannelReceiver = broadcast::Receiver<Arc<Envelope>>;

/// Registry of named broadcast channels.
///
/// Cloning is cheap; clones see the same channels. One hub stands for "the
/// platform broadcast primitive" of a process.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    channels: Arc<DashMap<String, ChannelSender>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sender for `name`, creating the channel on first use.
    pub fn channel(&self, name: &str) -> ChannelSender {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, name: &str) -> ChannelReceiver {
        self.channel(name).subscribe()
    }

    /// Number of live receivers on `name`.
    pub fn receiver_count(&self, name: &str) -> usize {
        self.channels
            .get(name)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

/// Envelopes a bridge pushed into its local hub from the far side.
///
/// The bridge's own hub subscription sees each of them once more; `take`
/// recognises that loopback and forgets the id. Entries whose loopback never
/// arrives (a lagged subscriber) are dropped wholesale once the set is full.
#[derive(Clone)]
pub(crate) struct RelayedIds {
    ids: Arc<DashSet<Uuid>>,
    capacity: usize,
}

impl RelayedIds {
    pub(crate) fn new() -> Self {
        Self::with_capacity(RELAYED_CAPACITY)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: Arc::new(DashSet::new()),
            capacity,
        }
    }

    /// Remember `id`. Returns `false` if it was already pending.
    pub(crate) fn insert(&self, id: Uuid) -> bool {
        if self.ids.len() >= self.capacity {
            tracing::warn!(
                "{} relayed envelopes never looped back, forgetting them",
                self.ids.len()
            );
            self.ids.clear();
        }
        self.ids.insert(id)
    }

    /// Whether `id` was injected by the bridge; forgets it either way.
    pub(crate) fn take(&self, id: &Uuid) -> bool {
        self.ids.remove(id).is_some()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }
}
