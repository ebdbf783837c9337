//! One execution context ("tab")
//!
//! [`ClientContext`] owns everything a tab needs: its broadcast transport,
//! settings replica, session manager and their background tasks. Construct it
//! at start-up, hand out the `Arc`s it exposes, and shut it down on exit.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::remote::SettingsAuthority;
use crate::session::{SessionManager, SessionTimings};
use crate::settings::{LoadSource, SettingsStore};
use crate::storage::PersistentCache;
use crate::sync::{BroadcastHub, BroadcastTransport};

pub struct ClientContext {
    transport: Arc<BroadcastTransport>,
    settings: Arc<SettingsStore>,
    session: Arc<SessionManager>,
    tasks: Vec<JoinHandle<()>>,
    load: watch::Receiver<SettingsLoad>,
}

/// Progress of the start-up settings load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SettingsLoad {
    source: LoadSource,
    settled: bool,
}

impl ClientContext {
    /// Start a tab on the system clock.
    ///
    /// Returns as soon as the cached replica is in place; reconciliation with
    /// the authority continues in the background. Must be called from within
    /// a Tokio runtime.
    pub fn start(
        config: &SyncConfig,
        cache: Arc<dyn PersistentCache>,
        authority: Arc<dyn SettingsAuthority>,
        hub: Option<&BroadcastHub>,
    ) -> Self {
        Self::start_with_clock(config, cache, authority, hub, Arc::new(SystemClock))
    }

    pub fn start_with_clock(
        config: &SyncConfig,
        cache: Arc<dyn PersistentCache>,
        authority: Arc<dyn SettingsAuthority>,
        hub: Option<&BroadcastHub>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let transport = Arc::new(BroadcastTransport::connect(hub, &config.channel_name));
        let session = Arc::new(SessionManager::new(
            clock,
            transport.clone(),
            SessionTimings::from(config),
        ));
        let settings = Arc::new(SettingsStore::new(cache, authority));

        session.listen();
        let cached = settings.load_cached();
        let (load_tx, load) = watch::channel(SettingsLoad {
            source: cached,
            settled: false,
        });

        let reconcile = {
            let settings = settings.clone();
            let session = session.clone();
            let id = transport.id();
            tokio::spawn(async move {
                let source = settings.reconcile_remote(cached).await;
                if source == LoadSource::Remote {
                    session.record_fetch();
                }
                tracing::debug!("Context {} settings settled from {:?}", id, source);
                load_tx.send_replace(SettingsLoad {
                    source,
                    settled: true,
                });
            })
        };

        let tasks = vec![session.spawn_monitor(), reconcile];
        tracing::info!(
            "Context {} started (cached settings from {:?})",
            transport.id(),
            cached
        );

        Self {
            transport,
            settings,
            session,
            tasks,
            load,
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn transport(&self) -> &Arc<BroadcastTransport> {
        &self.transport
    }

    /// Where the settings replica currently comes from. `Cache` or
    /// `Defaults` until the background reconciliation settles.
    pub fn load_source(&self) -> LoadSource {
        self.load.borrow().source
    }

    /// Wait for the start-up reconciliation with the authority to finish.
    pub async fn settings_loaded(&self) -> LoadSource {
        let mut load = self.load.clone();
        let source = match load.wait_for(|l| l.settled).await {
            Ok(state) => state.source,
            Err(_) => self.load.borrow().source,
        };
        source
    }

    /// Stop background work and close the transport.
    pub fn shutdown(mut self) {
        self.release();
    }

    fn release(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.transport.close();
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        self.release();
    }
}
