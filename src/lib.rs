//! # tabsync - Cross-tab session and settings synchronization
//!
//! Keeps session liveness and user settings consistent across several
//! independently scheduled execution contexts ("tabs") that share a
//! persistent cache and a best-effort broadcast channel, while a remote
//! authority holds the canonical settings.
//!
//! ## Features
//!
//! - **Session liveness**: debounced refresh, periodic expiry, last-message-wins adoption across tabs
//! - **Optimistic settings**: local-first writes with rollback and per-key change notifications
//! - **Graceful degradation**: no broadcast means single-tab mode, no authority means cached values
//! - **Cross-process relay**: WebSocket bridge so tabs in separate processes share one channel
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tabsync::{BroadcastHub, ClientContext, MemoryCache, SettingKey, SettingValue, SyncConfig};
//! use tabsync::remote::OfflineAuthority;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig::default();
//!     let hub = BroadcastHub::new();
//!     let tab = ClientContext::start(
//!         &config,
//!         Arc::new(MemoryCache::new()),
//!         Arc::new(OfflineAuthority),
//!         Some(&hub),
//!     );
//!     tab.settings_loaded().await;
//!
//!     let _sub = tab.settings().on_key_changed(SettingKey::SidebarVersion, |event| {
//!         println!("{}: {}", event.name(), event.detail());
//!     });
//!
//!     tab.session().refresh_session();
//!     tab.settings()
//!         .update_setting(SettingKey::Ads, SettingValue::Int(0))
//!         .await;
//!     tab.shutdown();
//! }
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod remote;
pub mod server;
pub mod session;
pub mod settings;
pub mod storage;
pub mod sync;

// Re-export main types for library consumers
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::SyncConfig;
pub use context::ClientContext;
pub use error::{RemoteError, SettingsError, SyncError};
pub use session::{SessionManager, SessionSnapshot};
pub use settings::{SettingKey, SettingValue, SettingsEvent, SettingsRecord, SettingsStore};
pub use storage::{MemoryCache, PersistentCache, SqliteCache};
pub use sync::{BroadcastHub, BroadcastMessage, BroadcastTransport, MessageKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
