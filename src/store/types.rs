use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Device platform as reported by providers. Anything unrecognized is
/// carried as `unknown` rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Apple,
    #[serde(other)]
    Unknown,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Apple => "apple",
            Platform::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "android" => Platform::Android,
            "apple" => Platform::Apple,
            _ => Platform::Unknown,
        }
    }
}

/// One provider's advertisement of one device. A device may carry several
/// sources simultaneously; the highest-priority one owns cool-down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Provider session id.
    pub id: String,
    /// Provider HTTP control endpoint.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_connect_address: Option<String>,
    /// Shared token echoed back when calling the provider.
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub udid: String,
    pub platform: Platform,
    pub properties: Map<String, Value>,
    /// provider-id → Source. The device is *present* iff non-empty.
    pub sources: BTreeMap<String, Source>,
    /// Empty = public; otherwise an email or group id.
    pub owner: String,
    pub using: bool,
    pub colding: bool,
    pub user_id: Option<String>,
    /// Lease epoch — doubles as the idle watcher's cancellation token.
    pub using_began_at: Option<DateTime<Utc>>,
    pub last_activated_at: Option<DateTime<Utc>>,
    /// Seconds of lessee inactivity before auto-release.
    pub idle_timeout: i64,
    /// Cumulative lease seconds.
    pub using_duration: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Derived, never stored.
    pub fn present(&self) -> bool {
        !self.sources.is_empty()
    }

    /// The source that owns release and cool-down: highest priority, ties
    /// broken deterministically by provider id order.
    pub fn best_source(&self) -> Option<&Source> {
        let mut best: Option<&Source> = None;
        for s in self.sources.values() {
            match best {
                Some(b) if s.priority <= b.priority => {}
                _ => best = Some(s),
            }
        }
        best
    }

    /// Wire representation: the record plus the derived `present` flag,
    /// with `sources` stripped unless the caller may see provider secrets.
    pub fn api_json(&self, include_sources: bool) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()));
        if let Value::Object(map) = &mut value {
            map.insert("present".to_string(), Value::Bool(self.present()));
            if !include_sources {
                map.remove("sources");
            }
        }
        value
    }
}

/// One mutation of a device record, as observed by change-feed subscribers.
/// `old = None` means the record was just inserted.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub old: Option<Device>,
    pub new: Device,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub email: String,
    pub username: String,
    pub admin: bool,
    /// Opaque bearer token for API use.
    pub token: String,
    pub secret_key: String,
    pub settings: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub last_logged_in_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Admin,
    User,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// Must not contain `@`, so it stays distinguishable from an email in
    /// `owner` comparisons.
    pub id: String,
    pub name: String,
    pub creator: String,
    pub members: BTreeMap<String, GroupRole>,
    pub created_at: DateTime<Utc>,
}
