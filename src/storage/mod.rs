//! Persistent key-value cache shared by all tabs
//!
//! Reads and writes are synchronous and short. Nothing here coordinates
//! concurrent writers; callers only ever write server-confirmed values,
//! pending optimistic values, or snapshot-consistent rollbacks.

pub mod db;
pub mod memory;

use anyhow::Result;

pub use db::SqliteCache;
pub use memory::MemoryCache;

/// Cache key holding the JSON-encoded settings record.
pub const SETTINGS_KEY: &str = "user_settings";

/// Durable per-origin key-value storage
pub trait PersistentCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}
