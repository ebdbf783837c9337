//! Settings authority: the backend holding the canonical record
//!
//! The store only sees the [`SettingsAuthority`] trait. [`HttpAuthority`]
//! talks to the REST endpoint; tests and embedders can supply their own.

pub mod http;

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::settings::{SettingsPatch, SettingsUpdate};

pub use http::HttpAuthority;

#[async_trait]
pub trait SettingsAuthority: Send + Sync {
    /// `GET` the canonical record.
    async fn fetch(&self) -> Result<SettingsPatch, RemoteError>;

    /// `POST` a full record; the response may normalize any field.
    async fn push(&self, update: &SettingsUpdate) -> Result<SettingsPatch, RemoteError>;
}

/// Supplies the bearer token for authority requests. Token issuance lives
/// outside this crate.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Fixed token, mostly for the CLI
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenSource for StaticToken {
    fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Authority that is never reachable. Leaves the store running purely on
/// its cached replica.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineAuthority;

#[async_trait]
impl SettingsAuthority for OfflineAuthority {
    async fn fetch(&self) -> Result<SettingsPatch, RemoteError> {
        Err(RemoteError::Unavailable("no settings authority configured".into()))
    }

    async fn push(&self, _update: &SettingsUpdate) -> Result<SettingsPatch, RemoteError> {
        Err(RemoteError::Unavailable("no settings authority configured".into()))
    }
}
