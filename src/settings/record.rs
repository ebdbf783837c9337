use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SettingsError;

/// Keys of the fixed settings schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    PlayerSidebar,
    Ads,
    Update,
    SidebarVersion,
    GlobalProfileBg,
    BackgroundUrl,
}

impl SettingKey {
    pub const ALL: [SettingKey; 6] = [
        SettingKey::PlayerSidebar,
        SettingKey::Ads,
        SettingKey::Update,
        SettingKey::SidebarVersion,
        SettingKey::GlobalProfileBg,
        SettingKey::BackgroundUrl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::PlayerSidebar => "player_sidebar",
            SettingKey::Ads => "ads",
            SettingKey::Update => "update",
            SettingKey::SidebarVersion => "sidebar_version",
            SettingKey::GlobalProfileBg => "global_profile_bg",
            SettingKey::BackgroundUrl => "background_url",
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| SettingsError::UnknownKey(s.to_string()))
    }
}

/// Value of a single setting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl SettingValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            SettingValue::Int(0) => Some(false),
            SettingValue::Int(1) => Some(true),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Parse command-line text into the value type `key` expects.
    pub fn parse_for(key: SettingKey, raw: &str) -> Result<Self, SettingsError> {
        let invalid = |reason: &str| SettingsError::InvalidValue {
            key: key.as_str(),
            reason: reason.to_string(),
        };

        match key {
            SettingKey::PlayerSidebar | SettingKey::Ads | SettingKey::Update => raw
                .trim()
                .parse::<i64>()
                .map(SettingValue::Int)
                .map_err(|_| invalid("expected 0 or 1")),
            SettingKey::GlobalProfileBg => match raw.trim() {
                "true" | "1" => Ok(SettingValue::Bool(true)),
                "false" | "0" => Ok(SettingValue::Bool(false)),
                _ => Err(invalid("expected true or false")),
            },
            SettingKey::SidebarVersion => Ok(SettingValue::Text(raw.to_string())),
            SettingKey::BackgroundUrl => match raw {
                "" | "null" => Ok(SettingValue::Null),
                url => Ok(SettingValue::Text(url.to_string())),
            },
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Null => f.write_str("null"),
            SettingValue::Bool(b) => write!(f, "{b}"),
            SettingValue::Int(i) => write!(f, "{i}"),
            SettingValue::Text(s) => f.write_str(s),
        }
    }
}

/// The replicated settings record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsRecord {
    pub player_sidebar: u8,
    pub ads: u8,
    pub update: u8,
    pub sidebar_version: String,
    pub global_profile_bg: bool,
    pub background_url: Option<String>,
}

impl Default for SettingsRecord {
    fn default() -> Self {
        Self {
            player_sidebar: 0,
            ads: 1,
            update: 1,
            sidebar_version: "v1".to_string(),
            global_profile_bg: false,
            background_url: None,
        }
    }
}

impl SettingsRecord {
    pub fn get(&self, key: SettingKey) -> SettingValue {
        match key {
            SettingKey::PlayerSidebar => SettingValue::Int(self.player_sidebar.into()),
            SettingKey::Ads => SettingValue::Int(self.ads.into()),
            SettingKey::Update => SettingValue::Int(self.update.into()),
            SettingKey::SidebarVersion => SettingValue::Text(self.sidebar_version.clone()),
            SettingKey::GlobalProfileBg => SettingValue::Bool(self.global_profile_bg),
            SettingKey::BackgroundUrl => self
                .background_url
                .clone()
                .map(SettingValue::Text)
                .unwrap_or(SettingValue::Null),
        }
    }

    /// Set one field, rejecting values outside the schema.
    pub fn set(&mut self, key: SettingKey, value: SettingValue) -> Result<(), SettingsError> {
        let invalid = |reason: String| SettingsError::InvalidValue {
            key: key.as_str(),
            reason,
        };

        match key {
            SettingKey::PlayerSidebar | SettingKey::Ads | SettingKey::Update => {
                let flag = match value {
                    SettingValue::Int(i @ (0 | 1)) => i as u8,
                    SettingValue::Bool(b) => u8::from(b),
                    other => return Err(invalid(format!("expected 0 or 1, got {other}"))),
                };
                match key {
                    SettingKey::PlayerSidebar => self.player_sidebar = flag,
                    SettingKey::Ads => self.ads = flag,
                    _ => self.update = flag,
                }
            }
            SettingKey::SidebarVersion => match value {
                SettingValue::Text(v) if !v.trim().is_empty() => self.sidebar_version = v,
                other => return Err(invalid(format!("expected a version string, got {other}"))),
            },
            SettingKey::GlobalProfileBg => match value.as_bool() {
                Some(b) => self.global_profile_bg = b,
                None => return Err(invalid(format!("expected a boolean, got {value}"))),
            },
            SettingKey::BackgroundUrl => match value {
                SettingValue::Null => self.background_url = None,
                SettingValue::Text(url) => self.background_url = Some(url),
                other => return Err(invalid(format!("expected a url or null, got {other}"))),
            },
        }

        Ok(())
    }

    /// Merge the fields present in an authority response. Out-of-schema
    /// values are skipped with a warning.
    pub fn apply(&mut self, patch: &SettingsPatch) {
        for key in SettingKey::ALL {
            if let Some(value) = patch.get(key) {
                if let Err(e) = self.set(key, value) {
                    tracing::warn!("Ignoring authority value: {}", e);
                }
            }
        }
    }

    pub fn to_update(&self) -> SettingsUpdate {
        SettingsUpdate {
            player_sidebar: self.player_sidebar,
            ads: self.ads,
            update: self.update,
            sidebar_version: self.sidebar_version.clone(),
            global_profile_bg: self.global_profile_bg,
        }
    }

    /// Keys whose value differs between two records
    pub fn diff(&self, other: &SettingsRecord) -> Vec<SettingKey> {
        SettingKey::ALL
            .into_iter()
            .filter(|k| self.get(*k) != other.get(*k))
            .collect()
    }
}

/// Body of the settings `POST`: the record minus `background_url`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub player_sidebar: u8,
    pub ads: u8,
    pub update: u8,
    pub sidebar_version: String,
    pub global_profile_bg: bool,
}

impl SettingsUpdate {
    /// Value this body carries for `key`; `background_url` is never sent.
    pub fn get(&self, key: SettingKey) -> Option<SettingValue> {
        match key {
            SettingKey::PlayerSidebar => Some(SettingValue::Int(self.player_sidebar.into())),
            SettingKey::Ads => Some(SettingValue::Int(self.ads.into())),
            SettingKey::Update => Some(SettingValue::Int(self.update.into())),
            SettingKey::SidebarVersion => Some(SettingValue::Text(self.sidebar_version.clone())),
            SettingKey::GlobalProfileBg => Some(SettingValue::Bool(self.global_profile_bg)),
            SettingKey::BackgroundUrl => None,
        }
    }
}

/// Authority response. Every field is optional because the authority may
/// echo only the fields it normalized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_sidebar: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ads: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<u8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidebar_version: Option<String>,

    #[serde(
        default,
        deserialize_with = "lenient_bool",
        skip_serializing_if = "Option::is_none"
    )]
    pub global_profile_bg: Option<bool>,

    /// `Some(None)` is an explicit `null` and clears the field
    #[serde(
        default,
        deserialize_with = "explicit_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub background_url: Option<Option<String>>,
}

impl SettingsPatch {
    /// Full response describing `record`.
    pub fn from_record(record: &SettingsRecord) -> Self {
        Self {
            success: Some(true),
            message: None,
            player_sidebar: Some(record.player_sidebar),
            ads: Some(record.ads),
            update: Some(record.update),
            sidebar_version: Some(record.sidebar_version.clone()),
            global_profile_bg: Some(record.global_profile_bg),
            background_url: Some(record.background_url.clone()),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: Some(false),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// A missing `success` flag counts as success.
    pub fn is_success(&self) -> bool {
        self.success.unwrap_or(true)
    }

    pub fn get(&self, key: SettingKey) -> Option<SettingValue> {
        match key {
            SettingKey::PlayerSidebar => self.player_sidebar.map(|v| SettingValue::Int(v.into())),
            SettingKey::Ads => self.ads.map(|v| SettingValue::Int(v.into())),
            SettingKey::Update => self.update.map(|v| SettingValue::Int(v.into())),
            SettingKey::SidebarVersion => self.sidebar_version.clone().map(SettingValue::Text),
            SettingKey::GlobalProfileBg => self.global_profile_bg.map(SettingValue::Bool),
            SettingKey::BackgroundUrl => self
                .background_url
                .clone()
                .map(|url| url.map(SettingValue::Text).unwrap_or(SettingValue::Null)),
        }
    }
}

fn explicit_null<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Bool(b) => Ok(Some(b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(Some(false)),
            Some(1) => Ok(Some(true)),
            _ => Err(D::Error::custom(format!("expected 0 or 1, got {n}"))),
        },
        other => Err(D::Error::custom(format!("expected a boolean, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_round_trip_through_strings() {
        for key in SettingKey::ALL {
            assert_eq!(key.as_str().parse::<SettingKey>().unwrap(), key);
        }
        assert!(matches!(
            "theme".parse::<SettingKey>(),
            Err(SettingsError::UnknownKey(_))
        ));
    }

    #[test]
    fn flags_only_accept_zero_or_one() {
        let mut record = SettingsRecord::default();
        assert!(record.set(SettingKey::Ads, SettingValue::Int(2)).is_err());
        assert!(record
            .set(SettingKey::Ads, SettingValue::Text("0".into()))
            .is_err());
        assert_eq!(record.ads, 1);

        record.set(SettingKey::Ads, SettingValue::Int(0)).unwrap();
        assert_eq!(record.ads, 0);

        record.set(SettingKey::Update, SettingValue::Bool(false)).unwrap();
        assert_eq!(record.get(SettingKey::Update), SettingValue::Int(0));
    }

    #[test]
    fn sidebar_version_must_not_be_blank() {
        let mut record = SettingsRecord::default();
        assert!(record
            .set(SettingKey::SidebarVersion, SettingValue::Text("  ".into()))
            .is_err());
        assert_eq!(record.sidebar_version, "v1");
    }

    #[test]
    fn partial_patch_only_touches_present_fields() {
        let mut record = SettingsRecord {
            background_url: Some("old".into()),
            ..Default::default()
        };
        let patch: SettingsPatch =
            serde_json::from_value(json!({ "sidebar_version": "v2" })).unwrap();

        record.apply(&patch);
        assert_eq!(record.sidebar_version, "v2");
        assert_eq!(record.background_url.as_deref(), Some("old"));
        assert!(patch.is_success());
    }

    #[test]
    fn explicit_null_clears_background() {
        let mut record = SettingsRecord {
            background_url: Some("old".into()),
            ..Default::default()
        };
        let patch: SettingsPatch =
            serde_json::from_value(json!({ "success": true, "background_url": null })).unwrap();

        record.apply(&patch);
        assert_eq!(record.background_url, None);
    }

    #[test]
    fn authority_flags_may_be_numeric() {
        let patch: SettingsPatch = serde_json::from_value(json!({
            "success": true,
            "global_profile_bg": 1,
            "player_sidebar": 1
        }))
        .unwrap();
        assert_eq!(patch.global_profile_bg, Some(true));
        assert_eq!(patch.get(SettingKey::PlayerSidebar), Some(SettingValue::Int(1)));
    }

    #[test]
    fn out_of_schema_patch_values_are_skipped() {
        let mut record = SettingsRecord::default();
        let patch = SettingsPatch {
            ads: Some(7),
            update: Some(0),
            ..Default::default()
        };

        record.apply(&patch);
        assert_eq!(record.ads, 1);
        assert_eq!(record.update, 0);
    }

    #[test]
    fn update_body_omits_background() {
        let record = SettingsRecord {
            background_url: Some("X".into()),
            ..Default::default()
        };
        let body = serde_json::to_value(record.to_update()).unwrap();
        assert!(body.get("background_url").is_none());
        assert_eq!(body["sidebar_version"], "v1");
    }

    #[test]
    fn parse_for_matches_key_types() {
        assert_eq!(
            SettingValue::parse_for(SettingKey::Ads, "0").unwrap(),
            SettingValue::Int(0)
        );
        assert_eq!(
            SettingValue::parse_for(SettingKey::GlobalProfileBg, "true").unwrap(),
            SettingValue::Bool(true)
        );
        assert_eq!(
            SettingValue::parse_for(SettingKey::BackgroundUrl, "null").unwrap(),
            SettingValue::Null
        );
        assert!(SettingValue::parse_for(SettingKey::Ads, "yes").is_err());
    }

    #[test]
    fn diff_lists_changed_keys() {
        let a = SettingsRecord::default();
        let mut b = a.clone();
        b.ads = 0;
        b.sidebar_version = "v3".into();
        assert_eq!(a.diff(&b), vec![SettingKey::Ads, SettingKey::SidebarVersion]);
    }
}
