//! Session liveness for one tab
//!
//! The session is purely client-derived: a tab is live while less than
//! `session_timeout` has passed since the last refresh, whether that refresh
//! happened here or in a sibling tab that broadcast it.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::{Clock, Timestamp};
use crate::config::SyncConfig;
use crate::sync::{BroadcastMessage, BroadcastTransport, MessageKind};

/// Timing knobs, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    pub session_timeout: i64,
    pub check_interval: u64,
    pub min_update_interval: i64,
    pub monotonic_adoption: bool,
}

impl From<&SyncConfig> for SessionTimings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            session_timeout: config.session_timeout_ms,
            check_interval: config.check_interval_ms,
            min_update_interval: config.min_update_interval_ms,
            monotonic_adoption: config.monotonic_adoption,
        }
    }
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// Observable session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub start_time: Timestamp,
    pub last_broadcast_time: Option<Timestamp>,
    pub last_fetch_time: Option<Timestamp>,
    pub active: bool,
    pub expired: bool,
}

impl SessionSnapshot {
    fn started_at(now: Timestamp) -> Self {
        Self {
            start_time: now,
            last_broadcast_time: None,
            last_fetch_time: None,
            active: true,
            expired: false,
        }
    }
}

pub struct SessionManager {
    state: Mutex<SessionSnapshot>,
    clock: Arc<dyn Clock>,
    transport: Arc<BroadcastTransport>,
    timings: SessionTimings,
    watch_tx: watch::Sender<SessionSnapshot>,
}

impl SessionManager {
    /// New active session starting now.
    pub fn new(
        clock: Arc<dyn Clock>,
        transport: Arc<BroadcastTransport>,
        timings: SessionTimings,
    ) -> Self {
        let initial = SessionSnapshot::started_at(clock.now_ms());
        let (watch_tx, _) = watch::channel(initial);

        Self {
            state: Mutex::new(initial),
            clock,
            transport,
            timings,
            watch_tx,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        *self.state.lock()
    }

    /// Receiver that sees every state change
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.watch_tx.subscribe()
    }

    pub fn is_expired(&self) -> bool {
        self.state.lock().expired
    }

    pub fn last_fetch_time(&self) -> Option<Timestamp> {
        self.state.lock().last_fetch_time
    }

    /// Pure read: is the session still within its timeout right now?
    pub fn check_session_status(&self) -> bool {
        let now = self.clock.now_ms();
        now.saturating_sub(self.state.lock().start_time) < self.timings.session_timeout
    }

    /// Restart the session and tell sibling tabs. Debounced: returns `false`
    /// without touching anything when the last accepted update is more recent
    /// than `min_update_interval`.
    pub fn refresh_session(&self) -> bool {
        let now = self.clock.now_ms();

        let snapshot = {
            let mut state = self.state.lock();
            if let Some(last) = state.last_broadcast_time {
                let since = now.saturating_sub(last);
                if since < self.timings.min_update_interval {
                    tracing::debug!("Session refresh debounced ({} ms since last)", since);
                    return false;
                }
            }

            state.start_time = now;
            state.last_broadcast_time = Some(now);
            state.active = true;
            state.expired = false;
            *state
        };

        self.watch_tx.send_replace(snapshot);
        self.publish_at(MessageKind::SessionRefresh, json!({}), now);
        tracing::debug!("Session refreshed at {}", now);
        true
    }

    /// Periodic tick. Flips to expired once the timeout has elapsed and
    /// reports whether that transition happened on this call.
    pub fn check_expiry(&self) -> bool {
        let now = self.clock.now_ms();

        let snapshot = {
            let mut state = self.state.lock();
            if state.expired
                || now.saturating_sub(state.start_time) < self.timings.session_timeout
            {
                return false;
            }
            state.expired = true;
            state.active = false;
            *state
        };

        tracing::info!("Session expired (started {})", snapshot.start_time);
        self.watch_tx.send_replace(snapshot);
        true
    }

    /// Publish `data` to sibling tabs stamped with the current time.
    /// Does nothing when broadcast is unavailable.
    pub fn broadcast_update(&self, kind: MessageKind, data: serde_json::Value) {
        self.publish_at(kind, data, self.clock.now_ms());
    }

    /// Publish stamped with `at`, the instant the local state changed.
    fn publish_at(&self, kind: MessageKind, data: serde_json::Value, at: Timestamp) {
        if !self.transport.is_available() {
            return;
        }
        self.transport.publish(BroadcastMessage::new(kind, data, at));
    }

    /// Note a successful settings fetch and share its time with siblings.
    pub fn record_fetch(&self) {
        let now = self.clock.now_ms();
        let snapshot = {
            let mut state = self.state.lock();
            state.last_fetch_time = Some(now);
            *state
        };

        self.watch_tx.send_replace(snapshot);
        self.publish_at(MessageKind::LastFetchUpdate, json!({ "time": now }), now);
    }

    /// Apply a message received from a sibling tab.
    pub fn handle_message(&self, message: &BroadcastMessage) {
        let snapshot = {
            let mut state = self.state.lock();
            match message.kind {
                MessageKind::SessionRefresh => {
                    if self.timings.monotonic_adoption && message.timestamp < state.start_time {
                        tracing::debug!(
                            "Ignoring stale session_refresh {} < {}",
                            message.timestamp,
                            state.start_time
                        );
                        return;
                    }
                    state.start_time = message.timestamp;
                    state.last_broadcast_time = Some(message.timestamp);
                    state.active = true;
                    state.expired = false;
                }
                MessageKind::LastFetchUpdate => {
                    state.last_fetch_time = Some(message.timestamp);
                }
                MessageKind::Other(ref kind) => {
                    tracing::trace!("Ignoring broadcast of kind {}", kind);
                    return;
                }
            }
            *state
        };

        self.watch_tx.send_replace(snapshot);
    }

    /// Called when the tab becomes visible or hidden. Regaining visibility
    /// while expired refreshes the session.
    pub fn on_visibility_change(&self, visible: bool) -> bool {
        if visible && self.is_expired() {
            return self.refresh_session();
        }
        false
    }

    /// Route sibling broadcasts into [`handle_message`](Self::handle_message).
    pub fn listen(self: &Arc<Self>) -> bool {
        let weak = Arc::downgrade(self);
        self.transport.subscribe(move |message| {
            if let Some(session) = weak.upgrade() {
                session.handle_message(&message);
            }
        })
    }

    /// Run [`check_expiry`](Self::check_expiry) every `check_interval`.
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = Duration::from_millis(self.timings.check_interval);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(session) => {
                        session.check_expiry();
                    }
                    None => break,
                }
            }
        })
    }
}
