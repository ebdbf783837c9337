//! In-process change notifications
//!
//! Consumers register per key and hold the returned [`Subscription`]; dropping
//! it releases the registration.

use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::record::{SettingKey, SettingValue};

/// Notification fanned out after a setting changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsEvent {
    SidebarPlayerToggled { enabled: bool },
    SidebarVersionChanged { version: String },
    SettingChanged { key: SettingKey, value: SettingValue },
}

impl SettingsEvent {
    pub fn for_change(key: SettingKey, value: &SettingValue) -> Self {
        match (key, value) {
            (SettingKey::PlayerSidebar, v) if v.as_bool().is_some() => {
                SettingsEvent::SidebarPlayerToggled {
                    enabled: v.as_bool().unwrap_or(false),
                }
            }
            (SettingKey::SidebarVersion, SettingValue::Text(version)) => {
                SettingsEvent::SidebarVersionChanged {
                    version: version.clone(),
                }
            }
            (key, value) => SettingsEvent::SettingChanged {
                key,
                value: value.clone(),
            },
        }
    }

    pub fn key(&self) -> SettingKey {
        match self {
            SettingsEvent::SidebarPlayerToggled { .. } => SettingKey::PlayerSidebar,
            SettingsEvent::SidebarVersionChanged { .. } => SettingKey::SidebarVersion,
            SettingsEvent::SettingChanged { key, .. } => *key,
        }
    }

    /// Event name as seen by presentation code
    pub fn name(&self) -> &'static str {
        match self {
            SettingsEvent::SidebarPlayerToggled { .. } => "sidebarPlayerToggled",
            SettingsEvent::SidebarVersionChanged { .. } => "sidebarVersionChanged",
            SettingsEvent::SettingChanged { .. } => "settingChanged",
        }
    }

    pub fn detail(&self) -> serde_json::Value {
        match self {
            SettingsEvent::SidebarPlayerToggled { enabled } => json!({ "enabled": enabled }),
            SettingsEvent::SidebarVersionChanged { version } => json!({ "version": version }),
            SettingsEvent::SettingChanged { key, value } => {
                json!({ "key": key.as_str(), "value": value })
            }
        }
    }
}

type Callback = Arc<dyn Fn(&SettingsEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Observers {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, SettingKey, Callback)>>,
}

impl Observers {
    pub(crate) fn register(self: &Arc<Self>, key: SettingKey, callback: Callback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, key, callback));

        Subscription {
            id,
            observers: Arc::downgrade(self),
            released: false,
        }
    }

    pub(crate) fn emit(&self, event: &SettingsEvent) {
        // Call outside the lock so callbacks may (un)subscribe
        let targets: Vec<Callback> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, key, _)| *key == event.key())
            .map(|(_, _, cb)| cb.clone())
            .collect();

        tracing::debug!("{} -> {} observer(s)", event.name(), targets.len());
        for callback in targets {
            callback(event);
        }
    }

    fn remove(&self, id: u64) {
        self.entries.lock().retain(|(entry, _, _)| *entry != id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Registration handle returned by `SettingsStore::on_key_changed`
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    observers: Weak<Observers>,
    released: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keep the callback registered for the lifetime of the store.
    pub fn detach(mut self) {
        self.released = true;
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(observers) = self.observers.upgrade() {
            observers.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_shapes() {
        let toggled = SettingsEvent::for_change(SettingKey::PlayerSidebar, &SettingValue::Int(1));
        assert_eq!(toggled, SettingsEvent::SidebarPlayerToggled { enabled: true });
        assert_eq!(toggled.name(), "sidebarPlayerToggled");
        assert_eq!(toggled.detail(), json!({ "enabled": true }));

        let version = SettingsEvent::for_change(
            SettingKey::SidebarVersion,
            &SettingValue::Text("v2".into()),
        );
        assert_eq!(version.name(), "sidebarVersionChanged");
        assert_eq!(version.detail(), json!({ "version": "v2" }));

        let ads = SettingsEvent::for_change(SettingKey::Ads, &SettingValue::Int(0));
        assert_eq!(ads.key(), SettingKey::Ads);
        assert_eq!(ads.detail(), json!({ "key": "ads", "value": 0 }));
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let observers = Arc::new(Observers::default());
        let hits = Arc::new(AtomicU64::new(0));

        let counter = hits.clone();
        let sub = observers.register(
            SettingKey::Ads,
            Arc::new(move |_: &SettingsEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let event = SettingsEvent::for_change(SettingKey::Ads, &SettingValue::Int(0));
        observers.emit(&event);
        drop(sub);
        observers.emit(&event);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(observers.len(), 0);
    }

    #[test]
    fn detached_subscription_stays_registered() {
        let observers = Arc::new(Observers::default());
        observers
            .register(SettingKey::Update, Arc::new(|_: &SettingsEvent| {}))
            .detach();
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn callbacks_only_see_their_key() {
        let observers = Arc::new(Observers::default());
        let hits = Arc::new(AtomicU64::new(0));

        let counter = hits.clone();
        let _sub = observers.register(
            SettingKey::SidebarVersion,
            Arc::new(move |_: &SettingsEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        observers.emit(&SettingsEvent::for_change(
            SettingKey::Ads,
            &SettingValue::Int(1),
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
