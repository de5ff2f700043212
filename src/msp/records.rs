//! Canonical records produced at the normalization boundary.
//!
//! Every record leaves here with a non-empty `id` and with defaults applied
//! once, so downstream code never re-derives them from raw JSON.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A device counts as online if it was active within this window.
pub const ONLINE_WINDOW_SECS: i64 = 15 * 60;

pub const DEFAULT_NETWORK_ID: &str = "default";

/// Timestamps above this are taken as milliseconds rather than seconds.
const MILLIS_THRESHOLD: f64 = 100_000_000_000.0;

/// A Firewalla gateway appliance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxRecord {
    pub id: String,
    pub gid: Option<String>,
    pub name: Option<String>,
    pub model: Option<String>,
    pub online: bool,
    pub version: Option<String>,
    pub location: Option<String>,
    pub device_count: Option<u64>,
}

impl BoxRecord {
    pub fn from_raw(raw: &Value, index: usize) -> Option<Self> {
        if !raw.is_object() {
            return None;
        }
        let gid = text(raw, "gid");
        let name = text(raw, "name");
        let id = gid
            .clone()
            .or_else(|| name.clone())
            .unwrap_or_else(|| format!("box_{}", index));
        Some(Self {
            id,
            gid,
            name,
            model: text(raw, "model"),
            online: raw.get("online").and_then(Value::as_bool).unwrap_or(false),
            version: text(raw, "version"),
            location: text(raw, "location"),
            device_count: unsigned(raw, "deviceCount"),
        })
    }

    /// `Firewalla <name>`, unless the vendor name already says Firewalla.
    pub fn display_name(&self) -> String {
        let name = self.name.as_deref().unwrap_or(&self.id);
        if name.to_lowercase().contains("firewalla") {
            name.to_string()
        } else {
            format!("Firewalla {}", name)
        }
    }
}

/// A LAN client observed by a box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: Option<String>,
    pub mac: Option<String>,
    pub ip: Option<String>,
    pub online: bool,
    pub network_id: String,
    pub network_name: Option<String>,
    pub box_gid: Option<String>,
    pub last_active: Option<DateTime<Utc>>,
    pub total_download: Option<u64>,
    pub total_upload: Option<u64>,
}

impl Device {
    pub fn from_raw(raw: &Value, index: usize, now: DateTime<Utc>) -> Option<Self> {
        if !raw.is_object() {
            return None;
        }
        let mac = mac_text(raw, "mac");
        let ip = text(raw, "ip");
        let id = mac_text(raw, "id")
            .or_else(|| mac.clone())
            .or_else(|| ip.clone())
            .unwrap_or_else(|| format!("device_{}", index));

        let last_active = raw
            .get("lastActiveTimestamp")
            .and_then(Value::as_f64)
            .and_then(timestamp_from_epoch);
        let online = match raw.get("online").and_then(Value::as_bool) {
            Some(online) => online,
            None => last_active
                .map(|ts| (now - ts).num_seconds() < ONLINE_WINDOW_SECS)
                .unwrap_or(false),
        };

        let network_id = text(raw, "networkId")
            .or_else(|| nested_text(raw, "network", "id"))
            .unwrap_or_else(|| DEFAULT_NETWORK_ID.to_string());

        Some(Self {
            id,
            name: text(raw, "name"),
            mac,
            ip,
            online,
            network_id,
            network_name: nested_text(raw, "network", "name"),
            box_gid: text(raw, "gid").or_else(|| text(raw, "boxId")),
            last_active,
            total_download: unsigned(raw, "totalDownload"),
            total_upload: unsigned(raw, "totalUpload"),
        })
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Firewalla Device {}", self.id))
    }
}

/// A firewall rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub action: Option<String>,
    pub status: Option<String>,
    pub direction: Option<String>,
    pub notes: Option<String>,
    pub target: Option<String>,
    pub scope: Option<String>,
    pub box_gid: Option<String>,
}

impl Rule {
    pub fn from_raw(raw: &Value, index: usize) -> Option<Self> {
        if !raw.is_object() {
            return None;
        }
        Some(Self {
            id: text(raw, "id").unwrap_or_else(|| format!("rule_{}", index)),
            action: text(raw, "action"),
            status: text(raw, "status"),
            direction: text(raw, "direction"),
            notes: text(raw, "notes"),
            target: nested_text(raw, "target", "value"),
            scope: nested_text(raw, "scope", "value"),
            box_gid: text(raw, "gid").or_else(|| text(raw, "boxId")),
        })
    }

    pub fn is_active(&self) -> bool {
        self.status.as_deref() == Some("active")
    }

    /// e.g. `Block: example.com`
    pub fn label(&self) -> String {
        let action = capitalize(self.action.as_deref().unwrap_or("rule"));
        let target = self
            .target
            .as_deref()
            .or(self.scope.as_deref())
            .or(self.notes.as_deref())
            .unwrap_or(&self.id);
        format!("{}: {}", action, target)
    }
}

/// A security alarm raised by a box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: String,
    pub aid: Option<String>,
    pub gid: Option<String>,
    pub alarm_type: Option<String>,
    pub message: Option<String>,
    pub ts: Option<f64>,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
}

impl Alarm {
    pub fn from_raw(raw: &Value, index: usize) -> Option<Self> {
        if !raw.is_object() {
            return None;
        }
        let aid = text(raw, "aid");
        let id = text(raw, "id").unwrap_or_else(|| match &aid {
            Some(aid) => format!("alarm_{}", aid),
            None => format!("alarm_{}", index),
        });
        Some(Self {
            id,
            aid,
            gid: text(raw, "gid"),
            alarm_type: text(raw, "_type").or_else(|| text(raw, "type")),
            message: text(raw, "message"),
            ts: raw.get("ts").and_then(Value::as_f64),
            device_id: nested_text(raw, "device", "id")
                .map(|id| strip_mac_prefix(&id))
                .filter(|id| !id.is_empty()),
            device_name: nested_text(raw, "device", "name"),
        })
    }
}

/// One traffic flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub ts: Option<f64>,
    pub direction: Option<String>,
    pub protocol: Option<String>,
    pub blocked: bool,
    pub download: u64,
    pub upload: u64,
    pub device_id: Option<String>,
    pub destination: Option<String>,
    pub box_gid: Option<String>,
}

impl Flow {
    pub fn from_raw(raw: &Value, index: usize) -> Option<Self> {
        if !raw.is_object() {
            return None;
        }
        Some(Self {
            id: text(raw, "id").unwrap_or_else(|| format!("flow_{}", index)),
            ts: raw.get("ts").and_then(Value::as_f64),
            direction: text(raw, "direction"),
            protocol: text(raw, "protocol"),
            blocked: raw.get("block").and_then(Value::as_bool).unwrap_or(false),
            download: unsigned(raw, "download").unwrap_or(0),
            upload: unsigned(raw, "upload").unwrap_or(0),
            device_id: nested_text(raw, "device", "id")
                .or_else(|| nested_text(raw, "source", "id"))
                .map(|id| strip_mac_prefix(&id))
                .filter(|id| !id.is_empty()),
            destination: nested_text(raw, "destination", "name")
                .or_else(|| nested_text(raw, "destination", "ip")),
            box_gid: text(raw, "gid"),
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.download.saturating_add(self.upload)
    }
}

/// A named set of domains/IPs referenced by rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetList {
    pub id: String,
    pub name: Option<String>,
    pub owner: Option<String>,
    pub category: Option<String>,
    pub targets: Vec<String>,
    pub notes: Option<String>,
}

impl TargetList {
    pub fn from_raw(raw: &Value, index: usize) -> Option<Self> {
        if !raw.is_object() {
            return None;
        }
        let targets = raw
            .get("targets")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        Some(Self {
            id: text(raw, "id").unwrap_or_else(|| format!("target_list_{}", index)),
            name: text(raw, "name"),
            owner: text(raw, "owner"),
            category: text(raw, "category"),
            targets,
            notes: text(raw, "notes"),
        })
    }
}

/// `GET stats/simple`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimpleStats {
    pub online_boxes: Option<u64>,
    pub offline_boxes: Option<u64>,
    pub alarms: Option<u64>,
    pub rules: Option<u64>,
}

/// Records that carry a per-category identifier.
pub trait Identified {
    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
}

macro_rules! identified {
    ($($ty:ty),*) => {
        $(impl Identified for $ty {
            fn id(&self) -> &str {
                &self.id
            }
            fn set_id(&mut self, id: String) {
                self.id = id;
            }
        })*
    };
}

identified!(BoxRecord, Device, Rule, Alarm, Flow, TargetList);

/// Make ids unique within one category. A repeated id gets its position
/// appended, so the result only depends on the input order.
pub fn ensure_unique_ids<T: Identified>(records: &mut [T]) {
    let mut seen = HashSet::new();
    for (index, record) in records.iter_mut().enumerate() {
        if !seen.insert(record.id().to_string()) {
            let mut candidate = format!("{}_{}", record.id(), index);
            while seen.contains(&candidate) {
                candidate.push('_');
            }
            seen.insert(candidate.clone());
            record.set_id(candidate);
        }
    }
}

/// Vendor MACs sometimes arrive as `mac:AA:BB:…`.
pub fn strip_mac_prefix(value: &str) -> String {
    match value.get(..4) {
        Some(prefix) if prefix.eq_ignore_ascii_case("mac:") => value[4..].to_string(),
        _ => value.to_string(),
    }
}

fn timestamp_from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let millis = if value >= MILLIS_THRESHOLD {
        value
    } else {
        value * 1000.0
    };
    DateTime::from_timestamp_millis(millis as i64)
}

fn text(raw: &Value, key: &str) -> Option<String> {
    match raw.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Like `text`, with a `mac:` prefix removed. A bare `mac:` counts as absent.
fn mac_text(raw: &Value, key: &str) -> Option<String> {
    text(raw, key)
        .map(|value| strip_mac_prefix(&value))
        .filter(|value| !value.is_empty())
}

fn nested_text(raw: &Value, outer: &str, key: &str) -> Option<String> {
    raw.get(outer).and_then(|inner| text(inner, key))
}

fn unsigned(raw: &Value, key: &str) -> Option<u64> {
    let value = raw.get(key)?;
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn box_id_precedence() {
        let now_box = BoxRecord::from_raw(&json!({"gid": "g1", "name": "Home"}), 0).unwrap();
        assert_eq!(now_box.id, "g1");
        let named = BoxRecord::from_raw(&json!({"name": "Office"}), 1).unwrap();
        assert_eq!(named.id, "Office");
        let bare = BoxRecord::from_raw(&json!({"model": "gold"}), 2).unwrap();
        assert_eq!(bare.id, "box_2");
        assert!(BoxRecord::from_raw(&json!("junk"), 3).is_none());
    }

    #[test]
    fn box_display_name_avoids_duplication() {
        let plain = BoxRecord::from_raw(&json!({"gid": "g", "name": "Home"}), 0).unwrap();
        assert_eq!(plain.display_name(), "Firewalla Home");
        let branded = BoxRecord::from_raw(&json!({"gid": "g", "name": "my firewalla"}), 0).unwrap();
        assert_eq!(branded.display_name(), "my firewalla");
    }

    #[test]
    fn device_id_and_mac_normalization() {
        let now = Utc::now();
        let dev = Device::from_raw(&json!({"mac": "mac:AA:BB", "ip": "10.0.0.2"}), 0, now).unwrap();
        assert_eq!(dev.id, "AA:BB");
        assert_eq!(dev.mac.as_deref(), Some("AA:BB"));
        assert_eq!(dev.network_id, DEFAULT_NETWORK_ID);

        let by_id = Device::from_raw(&json!({"id": "mac:CC:DD", "mac": "CC:DD"}), 0, now).unwrap();
        assert_eq!(by_id.id, "CC:DD");

        let by_ip = Device::from_raw(&json!({"ip": "10.0.0.3"}), 0, now).unwrap();
        assert_eq!(by_ip.id, "10.0.0.3");

        let synthetic = Device::from_raw(&json!({"name": "ghost"}), 4, now).unwrap();
        assert_eq!(synthetic.id, "device_4");
    }

    #[test]
    fn bare_mac_prefix_never_becomes_an_id() {
        let now = Utc::now();
        let bare = Device::from_raw(&json!({"mac": "mac:"}), 3, now).unwrap();
        assert_eq!(bare.id, "device_3");
        assert!(bare.mac.is_none());

        let bare_id = Device::from_raw(&json!({"id": "MAC:", "mac": "AA:BB"}), 0, now).unwrap();
        assert_eq!(bare_id.id, "AA:BB");

        let alarm = Alarm::from_raw(&json!({"aid": 1, "device": {"id": "mac:"}}), 0).unwrap();
        assert!(alarm.device_id.is_none());
        let flow = Flow::from_raw(&json!({"device": {"id": "mac:"}}), 0).unwrap();
        assert!(flow.device_id.is_none());
    }

    #[test]
    fn device_online_derivation() {
        let now = Utc::now();
        let recent_ms = (now - Duration::minutes(5)).timestamp_millis();
        let old_secs = (now - Duration::minutes(30)).timestamp();

        let recent =
            Device::from_raw(&json!({"mac": "A", "lastActiveTimestamp": recent_ms}), 0, now)
                .unwrap();
        assert!(recent.online);

        let old = Device::from_raw(&json!({"mac": "B", "lastActiveTimestamp": old_secs}), 0, now)
            .unwrap();
        assert!(!old.online);

        let explicit = Device::from_raw(
            &json!({"mac": "C", "online": true, "lastActiveTimestamp": old_secs}),
            0,
            now,
        )
        .unwrap();
        assert!(explicit.online);

        let unknown = Device::from_raw(&json!({"mac": "D"}), 0, now).unwrap();
        assert!(!unknown.online);
    }

    #[test]
    fn device_box_ownership_accepts_both_keys() {
        let now = Utc::now();
        let a = Device::from_raw(&json!({"mac": "A", "gid": "g1"}), 0, now).unwrap();
        let b = Device::from_raw(&json!({"mac": "B", "boxId": "g2"}), 0, now).unwrap();
        assert_eq!(a.box_gid.as_deref(), Some("g1"));
        assert_eq!(b.box_gid.as_deref(), Some("g2"));
    }

    #[test]
    fn alarm_ids_from_aid() {
        let with_aid = Alarm::from_raw(&json!({"aid": 42, "gid": "g"}), 0).unwrap();
        assert_eq!(with_aid.id, "alarm_42");
        assert_eq!(with_aid.aid.as_deref(), Some("42"));
        let bare = Alarm::from_raw(&json!({"message": "x"}), 7).unwrap();
        assert_eq!(bare.id, "alarm_7");
    }

    #[test]
    fn rule_label_and_status() {
        let rule = Rule::from_raw(
            &json!({
                "id": "r1",
                "action": "block",
                "status": "active",
                "target": {"value": "example.com"}
            }),
            0,
        )
        .unwrap();
        assert!(rule.is_active());
        assert_eq!(rule.label(), "Block: example.com");

        let paused = Rule::from_raw(&json!({"status": "paused"}), 3).unwrap();
        assert_eq!(paused.id, "rule_3");
        assert!(!paused.is_active());
        assert_eq!(paused.label(), "Rule: rule_3");
    }

    #[test]
    fn duplicate_ids_are_disambiguated_deterministically() {
        let now = Utc::now();
        let raw = [json!({"mac": "A"}), json!({"mac": "A"}), json!({"mac": "B"})];
        let build = || {
            let mut devices: Vec<Device> = raw
                .iter()
                .enumerate()
                .filter_map(|(i, r)| Device::from_raw(r, i, now))
                .collect();
            ensure_unique_ids(&mut devices);
            devices.into_iter().map(|d| d.id).collect::<Vec<_>>()
        };
        let first = build();
        assert_eq!(first, vec!["A", "A_1", "B"]);
        assert_eq!(first, build());
    }
}
