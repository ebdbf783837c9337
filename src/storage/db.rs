use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::PersistentCache;

/// SQLite-backed cache shared by every process that opens the same file.
///
/// Writes are last-writer-wins at the row level, which is all the settings
/// store needs.
#[derive(Clone)]
pub struct SqliteCache {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCache {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open cache: {}", path.display()))?;

        // WAL lets sibling processes read while one of them writes
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("Cache {} opened in {} mode", path.display(), mode);
        conn.busy_timeout(Duration::from_secs(5))?;

        let cache = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        cache.initialize()?;
        Ok(cache)
    }

    /// Private cache that disappears with the handle. Used by tests and by
    /// contexts that run without a cache file.
    pub fn in_memory() -> Result<Self> {
        let cache = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        cache.initialize()?;
        Ok(cache)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(())
    }
}

impl PersistentCache for SqliteCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM kv_cache WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv_cache (key, value, updated_at)
             VALUES (?1, ?2, strftime('%s', 'now'))
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = strftime('%s', 'now')",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv_cache WHERE key = ?1", params![key])?;
        Ok(())
    }
}
