//! Settings replica
//!
//! A fixed-schema record replicated from the settings authority, cached in
//! the shared persistent store, and written optimistically.

pub mod events;
pub mod record;
pub mod store;

pub use events::{SettingsEvent, Subscription};
pub use record::{SettingKey, SettingValue, SettingsPatch, SettingsRecord, SettingsUpdate};
pub use store::{LoadSource, SettingsStore};
