use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::events::{Observers, SettingsEvent, Subscription};
use super::record::{SettingKey, SettingValue, SettingsPatch, SettingsRecord};
use crate::error::{RemoteError, SyncError};
use crate::remote::SettingsAuthority;
use crate::storage::{PersistentCache, SETTINGS_KEY};

/// Where the current replica came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Remote,
    Cache,
    Defaults,
}

/// In-memory replica.
///
/// `visible` is always `confirmed` with every pending optimistic write laid
/// over it in call order. Rolling back a write is just dropping it from
/// `pending` and rebuilding, so a failed call can never hide a newer write to
/// the same key.
///
/// Writes are numbered. A key only ever moves forward in that numbering:
/// once write `n` to a key is committed, older writes to the same key are
/// dropped from `pending` and their late responses are ignored for that key.
struct Replica {
    confirmed: SettingsRecord,
    visible: SettingsRecord,
    pending: BTreeMap<u64, (SettingKey, SettingValue)>,
    committed: HashMap<SettingKey, u64>,
    /// Writes numbered below this were discarded by a refresh
    barrier: u64,
}

impl Replica {
    fn new(record: SettingsRecord) -> Self {
        Self {
            visible: record.clone(),
            confirmed: record,
            pending: BTreeMap::new(),
            committed: HashMap::new(),
            barrier: 0,
        }
    }

    fn rebuild(&mut self) {
        let mut visible = self.confirmed.clone();
        for (key, value) in self.pending.values() {
            // Values were validated when they entered `pending`
            let _ = visible.set(*key, value.clone());
        }
        self.visible = visible;
    }

    fn superseded(&self, seq: u64, key: SettingKey) -> bool {
        seq < self.barrier || self.committed.get(&key).is_some_and(|newest| *newest > seq)
    }

    /// Commit write `seq` of `key`. Returns `false` when a newer write to the
    /// key already committed or a refresh discarded this one.
    fn commit(&mut self, seq: u64, key: SettingKey, value: SettingValue) -> bool {
        if self.superseded(seq, key) {
            return false;
        }
        if let Err(e) = self.confirmed.set(key, value) {
            tracing::warn!("Ignoring authority value: {}", e);
        }
        self.committed.insert(key, seq);
        self.pending.retain(|s, (k, _)| *k != key || *s > seq);
        true
    }

    /// Adopt a field the authority changed while answering write `seq`.
    /// In-flight writes to that key stay pending and keep their claim.
    fn adopt(&mut self, seq: u64, key: SettingKey, value: SettingValue) {
        if self.superseded(seq, key) {
            return;
        }
        if let Err(e) = self.confirmed.set(key, value) {
            tracing::warn!("Ignoring authority value: {}", e);
        }
    }
}

/// Local-first replica of the settings record.
///
/// Reads are synchronous and never fail. Writes apply optimistically, then
/// reconcile with the authority and roll back on failure.
pub struct SettingsStore {
    replica: RwLock<Replica>,
    cache: Arc<dyn PersistentCache>,
    authority: Arc<dyn SettingsAuthority>,
    observers: Arc<Observers>,
    next_seq: AtomicU64,
}

impl SettingsStore {
    pub fn new(cache: Arc<dyn PersistentCache>, authority: Arc<dyn SettingsAuthority>) -> Self {
        Self {
            replica: RwLock::new(Replica::new(SettingsRecord::default())),
            cache,
            authority,
            observers: Arc::new(Observers::default()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Adopt the cached replica, or defaults when there is none.
    pub fn load_cached(&self) -> LoadSource {
        let (record, source) = match self.read_cache() {
            Some(record) => (record, LoadSource::Cache),
            None => (SettingsRecord::default(), LoadSource::Defaults),
        };

        let mut replica = self.replica.write();
        replica.confirmed = record;
        replica.rebuild();
        source
    }

    /// Startup load: expose the cached replica at once, then reconcile with
    /// the authority. An unreachable authority leaves the cached replica in
    /// place and is not reported.
    pub async fn load(&self) -> LoadSource {
        let local = self.load_cached();
        self.reconcile_remote(local).await
    }

    /// Remote half of [`load`](Self::load): fetch the canonical record and
    /// merge it. Returns `Remote` on success and `local` otherwise.
    pub async fn reconcile_remote(&self, local: LoadSource) -> LoadSource {
        match self.fetch_confirmed().await {
            Ok(patch) => {
                self.reconcile(|replica| replica.confirmed.apply(&patch), false);
                tracing::info!("Settings reconciled with authority");
                LoadSource::Remote
            }
            Err(e) => {
                tracing::warn!("Settings authority unavailable, using {:?} replica: {}", local, e);
                local
            }
        }
    }

    /// Unconditional re-fetch. Overwrites the replica and discards any
    /// pending optimistic writes; responses to them arriving later are
    /// ignored.
    pub async fn refresh_settings(&self) -> Result<SettingsRecord, SyncError> {
        let patch = self.fetch_confirmed().await?;
        Ok(self.reconcile(|replica| replica.confirmed.apply(&patch), true))
    }

    /// Reset to defaults and forget the persisted replica. Pending writes are
    /// dropped and their eventual responses no longer touch the replica.
    pub fn clear_cache(&self) -> Result<(), SyncError> {
        self.reconcile(|replica| replica.confirmed = SettingsRecord::default(), true);
        self.cache.remove(SETTINGS_KEY).map_err(SyncError::Cache)
    }

    pub fn get_setting(&self, key: SettingKey) -> SettingValue {
        self.replica.read().visible.get(key)
    }

    pub fn snapshot(&self) -> SettingsRecord {
        self.replica.read().visible.clone()
    }

    /// Number of optimistic writes awaiting the authority
    pub fn pending_writes(&self) -> usize {
        self.replica.read().pending.len()
    }

    /// Optimistically set `key`, then confirm with the authority.
    ///
    /// Returns `false` when the value was rejected locally or by the
    /// authority; the setting is then unchanged even though the optimistic
    /// value may briefly have been visible.
    pub async fn update_setting(&self, key: SettingKey, value: SettingValue) -> bool {
        match self.try_update_setting(key, value).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Update of {} failed: {}", key, e);
                false
            }
        }
    }

    /// Like [`update_setting`](Self::update_setting) but reports why it failed.
    pub async fn try_update_setting(
        &self,
        key: SettingKey,
        value: SettingValue,
    ) -> Result<SettingValue, SyncError> {
        let (seq, update) = {
            let mut replica = self.replica.write();

            let mut candidate = replica.visible.clone();
            candidate.set(key, value)?;

            // Numbered under the lock so a concurrent refresh sees it either
            // pending or not yet issued
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            replica.pending.insert(seq, (key, candidate.get(key)));
            replica.rebuild();
            self.persist(&replica.visible);
            (seq, replica.visible.to_update())
        };

        match self.authority.push(&update).await.and_then(confirm) {
            Ok(patch) => {
                let (confirmed, events) = {
                    let mut replica = self.replica.write();
                    let before = replica.visible.clone();

                    let written = replica.pending.remove(&seq).map(|(_, value)| value);
                    let committed = match patch.get(key).or(written) {
                        Some(value) => replica.commit(seq, key, value),
                        None => false,
                    };
                    if !committed {
                        tracing::debug!("Write {} to {} superseded", seq, key);
                    }

                    // Other fields count only where the authority changed
                    // what this call sent; echoes of the body are stale
                    for other in SettingKey::ALL.into_iter().filter(|k| *k != key) {
                        if let Some(value) = patch.get(other) {
                            if update.get(other).as_ref() != Some(&value) {
                                replica.adopt(seq, other, value);
                            }
                        }
                    }

                    replica.rebuild();
                    self.persist(&replica.visible);

                    let confirmed = replica.confirmed.get(key);
                    let mut events = vec![SettingsEvent::for_change(key, &confirmed)];
                    events.extend(
                        before
                            .diff(&replica.visible)
                            .into_iter()
                            .filter(|k| *k != key)
                            .map(|k| SettingsEvent::for_change(k, &replica.visible.get(k))),
                    );
                    (confirmed, events)
                };

                tracing::debug!("Authority confirmed {} = {}", key, confirmed);
                for event in &events {
                    self.observers.emit(event);
                }
                Ok(confirmed)
            }
            Err(e) => {
                let mut replica = self.replica.write();
                // A refresh may already have discarded this write
                if replica.pending.remove(&seq).is_some() {
                    replica.rebuild();
                    self.persist(&replica.visible);
                }
                tracing::debug!("Rolled back {}: now {}", key, replica.visible.get(key));
                Err(e.into())
            }
        }
    }

    /// Register `callback` for changes of `key`. The registration lasts as
    /// long as the returned handle.
    pub fn on_key_changed<F>(&self, key: SettingKey, callback: F) -> Subscription
    where
        F: Fn(&SettingsEvent) + Send + Sync + 'static,
    {
        self.observers.register(key, Arc::new(callback))
    }

    async fn fetch_confirmed(&self) -> Result<SettingsPatch, RemoteError> {
        self.authority.fetch().await.and_then(confirm)
    }

    /// Apply `change` to the confirmed record, rebuild, persist, and notify
    /// every key whose visible value moved.
    fn reconcile<F>(&self, change: F, discard_pending: bool) -> SettingsRecord
    where
        F: FnOnce(&mut Replica),
    {
        let (events, record) = {
            let mut replica = self.replica.write();
            let before = replica.visible.clone();

            change(&mut *replica);
            if discard_pending {
                if !replica.pending.is_empty() {
                    tracing::info!("Discarding {} pending settings write(s)", replica.pending.len());
                    replica.pending.clear();
                }
                replica.barrier = self.next_seq.load(Ordering::SeqCst);
            }
            replica.rebuild();
            self.persist(&replica.visible);

            let events: Vec<SettingsEvent> = before
                .diff(&replica.visible)
                .into_iter()
                .map(|key| SettingsEvent::for_change(key, &replica.visible.get(key)))
                .collect();
            (events, replica.visible.clone())
        };

        for event in &events {
            self.observers.emit(event);
        }
        record
    }

    fn read_cache(&self) -> Option<SettingsRecord> {
        match self.cache.get(SETTINGS_KEY) {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("Ignoring corrupt settings cache: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Settings cache unreadable: {:#}", e);
                None
            }
        }
    }

    fn persist(&self, record: &SettingsRecord) {
        let result = serde_json::to_string(record)
            .map_err(anyhow::Error::from)
            .and_then(|json| self.cache.set(SETTINGS_KEY, &json));

        if let Err(e) = result {
            tracing::warn!("Failed to persist settings: {:#}", e);
        }
    }
}

fn confirm(patch: SettingsPatch) -> Result<SettingsPatch, RemoteError> {
    if patch.is_success() {
        Ok(patch)
    } else {
        Err(RemoteError::Rejected(
            patch
                .message
                .unwrap_or_else(|| "success: false".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::OfflineAuthority;
    use crate::storage::MemoryCache;

    fn offline_store(cache: &MemoryCache) -> SettingsStore {
        SettingsStore::new(Arc::new(cache.clone()), Arc::new(OfflineAuthority))
    }

    #[test]
    fn empty_cache_yields_defaults() {
        let cache = MemoryCache::new();
        let store = offline_store(&cache);

        assert_eq!(store.load_cached(), LoadSource::Defaults);
        assert_eq!(store.snapshot(), SettingsRecord::default());
    }

    #[test]
    fn corrupt_cache_falls_back_to_defaults() {
        let cache = MemoryCache::new();
        cache.set(SETTINGS_KEY, "{not json").unwrap();
        let store = offline_store(&cache);

        assert_eq!(store.load_cached(), LoadSource::Defaults);
        assert_eq!(store.get_setting(SettingKey::Ads), SettingValue::Int(1));
    }

    #[test]
    fn cached_replica_is_visible_synchronously() {
        let cache = MemoryCache::new();
        let cached = SettingsRecord {
            ads: 0,
            sidebar_version: "v7".into(),
            ..Default::default()
        };
        cache
            .set(SETTINGS_KEY, &serde_json::to_string(&cached).unwrap())
            .unwrap();
        let store = offline_store(&cache);

        assert_eq!(store.load_cached(), LoadSource::Cache);
        assert_eq!(
            store.get_setting(SettingKey::SidebarVersion),
            SettingValue::Text("v7".into())
        );
    }

    #[tokio::test]
    async fn invalid_value_never_touches_replica() {
        let cache = MemoryCache::new();
        let store = offline_store(&cache);

        let err = store
            .try_update_setting(SettingKey::PlayerSidebar, SettingValue::Int(3))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Settings(_)));
        assert_eq!(store.pending_writes(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_cache_resets_to_defaults() {
        let cache = MemoryCache::new();
        let cached = SettingsRecord {
            ads: 0,
            ..Default::default()
        };
        cache
            .set(SETTINGS_KEY, &serde_json::to_string(&cached).unwrap())
            .unwrap();
        let store = offline_store(&cache);
        store.load_cached();

        store.clear_cache().unwrap();
        assert_eq!(store.snapshot(), SettingsRecord::default());
        assert!(cache.is_empty());
    }

    #[test]
    fn confirm_maps_rejections() {
        assert!(confirm(SettingsPatch::default()).is_ok());
        match confirm(SettingsPatch::rejected("sidebar locked")) {
            Err(RemoteError::Rejected(msg)) => assert_eq!(msg, "sidebar locked"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
