//! Entity descriptors: what the presentation side renders from a snapshot.
//!
//! A descriptor is a tagged variant naming the record it mirrors;
//! `entity_state` maps a snapshot plus a descriptor to a display value.

use serde::{Deserialize, Serialize};

use super::coordinator::CoordinatorOptions;
use super::snapshot::Snapshot;

const DOMAIN: &str = "firewalla";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Sensor,
    BinarySensor,
    Switch,
    DeviceTracker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityKind {
    BoxOnline { box_id: String },
    DeviceOnline { device_id: String },
    DeviceTracker { device_id: String },
    DeviceMac { device_id: String },
    DeviceIp { device_id: String },
    DeviceNetwork { device_id: String },
    DeviceDownload { device_id: String },
    DeviceUpload { device_id: String },
    RuleSwitch { rule_id: String },
    RecentAlarms,
    FlowVolume { flow_id: String },
    TargetListSize { list_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub unique_id: String,
    pub name: String,
    pub platform: Platform,
    /// Registry device the entity hangs off (`box_<id>` for boxes).
    pub parent: Option<String>,
    #[serde(flatten)]
    pub kind: EntityKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EntityState {
    On,
    Off,
    Text(String),
    Kilobytes(f64),
    Count(u64),
    /// The record is gone from the snapshot.
    Unavailable,
}

impl EntityState {
    fn flag(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityView {
    #[serde(flatten)]
    pub descriptor: EntityDescriptor,
    pub state: EntityState,
}

/// Descriptors for everything a snapshot should render, given the entry's
/// feature toggles.
pub fn describe(snapshot: &Snapshot, options: &CoordinatorOptions) -> Vec<EntityDescriptor> {
    let mut out = Vec::new();
    let first_box = snapshot.boxes.first().map(|b| format!("box_{}", b.id));

    for b in &snapshot.boxes {
        out.push(EntityDescriptor {
            unique_id: format!("{}_box_online_{}", DOMAIN, b.id),
            name: format!("{} Online", b.display_name()),
            platform: Platform::BinarySensor,
            parent: Some(format!("box_{}", b.id)),
            kind: EntityKind::BoxOnline {
                box_id: b.id.clone(),
            },
        });
    }

    if options.track_devices {
        for d in &snapshot.devices {
            let name = d.display_name();
            let parent = Some(d.id.clone());
            let mut push = |suffix: &str, label: &str, platform, kind| {
                out.push(EntityDescriptor {
                    unique_id: format!("{}_{}_{}", DOMAIN, suffix, d.id),
                    name: format!("{} {}", name, label),
                    platform,
                    parent: parent.clone(),
                    kind,
                });
            };
            let id = || d.id.clone();

            push(
                "online",
                "Online",
                Platform::BinarySensor,
                EntityKind::DeviceOnline { device_id: id() },
            );
            push(
                "tracker",
                "Presence",
                Platform::DeviceTracker,
                EntityKind::DeviceTracker { device_id: id() },
            );
            push(
                "mac_address",
                "MAC Address",
                Platform::Sensor,
                EntityKind::DeviceMac { device_id: id() },
            );
            push(
                "ip_address",
                "IP Address",
                Platform::Sensor,
                EntityKind::DeviceIp { device_id: id() },
            );
            push(
                "network_name",
                "Network Name",
                Platform::Sensor,
                EntityKind::DeviceNetwork { device_id: id() },
            );

            if options.enable_traffic {
                if d.total_download.is_some() {
                    push(
                        "total_download",
                        "Total Download",
                        Platform::Sensor,
                        EntityKind::DeviceDownload { device_id: id() },
                    );
                }
                if d.total_upload.is_some() {
                    push(
                        "total_upload",
                        "Total Upload",
                        Platform::Sensor,
                        EntityKind::DeviceUpload { device_id: id() },
                    );
                }
            }
        }
    }

    if options.enable_rules {
        for r in &snapshot.rules {
            out.push(EntityDescriptor {
                unique_id: format!("{}_rule_switch_{}", DOMAIN, r.id),
                name: r.label(),
                platform: Platform::Switch,
                parent: r
                    .box_gid
                    .as_ref()
                    .map(|g| format!("box_{}", g))
                    .or_else(|| first_box.clone()),
                kind: EntityKind::RuleSwitch {
                    rule_id: r.id.clone(),
                },
            });
        }
    }

    if options.enable_alarms {
        out.push(EntityDescriptor {
            unique_id: format!("{}_recent_alarms", DOMAIN),
            name: "Firewalla Recent Alarms".to_string(),
            platform: Platform::Sensor,
            parent: first_box.clone(),
            kind: EntityKind::RecentAlarms,
        });
    }

    if options.enable_flows {
        for f in &snapshot.flows {
            out.push(EntityDescriptor {
                unique_id: format!("{}_flow_{}", DOMAIN, f.id),
                name: format!("Flow to {}", f.destination.as_deref().unwrap_or("unknown")),
                platform: Platform::Sensor,
                parent: f
                    .device_id
                    .as_ref()
                    .filter(|id| snapshot.device(id).is_some())
                    .cloned(),
                kind: EntityKind::FlowVolume {
                    flow_id: f.id.clone(),
                },
            });
        }
    }

    if options.enable_target_lists {
        for t in &snapshot.target_lists {
            out.push(EntityDescriptor {
                unique_id: format!("{}_target_list_{}", DOMAIN, t.id),
                name: format!("Target List {}", t.name.as_deref().unwrap_or(&t.id)),
                platform: Platform::Sensor,
                parent: first_box.clone(),
                kind: EntityKind::TargetListSize {
                    list_id: t.id.clone(),
                },
            });
        }
    }

    out
}

pub fn entity_state(snapshot: &Snapshot, kind: &EntityKind) -> EntityState {
    use EntityState::*;

    let device = |id: &str| snapshot.devices.iter().find(|d| d.id == id);

    match kind {
        EntityKind::BoxOnline { box_id } => snapshot
            .boxes
            .iter()
            .find(|b| &b.id == box_id)
            .map_or(Unavailable, |b| EntityState::flag(b.online)),
        EntityKind::DeviceOnline { device_id } | EntityKind::DeviceTracker { device_id } => {
            device(device_id).map_or(Unavailable, |d| EntityState::flag(d.online))
        }
        EntityKind::DeviceMac { device_id } => device(device_id).map_or(Unavailable, |d| {
            Text(d.mac.clone().unwrap_or_else(|| d.id.clone()))
        }),
        EntityKind::DeviceIp { device_id } => device(device_id).map_or(Unavailable, |d| {
            Text(d.ip.clone().unwrap_or_else(|| "Unknown".to_string()))
        }),
        EntityKind::DeviceNetwork { device_id } => device(device_id).map_or(Unavailable, |d| {
            Text(d.network_name.clone().unwrap_or_else(|| "Unknown".to_string()))
        }),
        EntityKind::DeviceDownload { device_id } => device(device_id)
            .map_or(Unavailable, |d| Kilobytes(kilobytes(d.total_download.unwrap_or(0)))),
        EntityKind::DeviceUpload { device_id } => device(device_id)
            .map_or(Unavailable, |d| Kilobytes(kilobytes(d.total_upload.unwrap_or(0)))),
        EntityKind::RuleSwitch { rule_id } => snapshot
            .rule(rule_id)
            .map_or(Unavailable, |r| EntityState::flag(r.is_active())),
        EntityKind::RecentAlarms => Text(
            snapshot
                .alarms
                .first()
                .and_then(|a| a.message.clone())
                .unwrap_or_else(|| "No Alarms".to_string()),
        ),
        EntityKind::FlowVolume { flow_id } => snapshot
            .flows
            .iter()
            .find(|f| &f.id == flow_id)
            .map_or(Unavailable, |f| Kilobytes(kilobytes(f.total_bytes()))),
        EntityKind::TargetListSize { list_id } => snapshot
            .target_lists
            .iter()
            .find(|t| &t.id == list_id)
            .map_or(Unavailable, |t| Count(t.targets.len() as u64)),
    }
}

/// Descriptors paired with their current state.
pub fn render(snapshot: &Snapshot, options: &CoordinatorOptions) -> Vec<EntityView> {
    describe(snapshot, options)
        .into_iter()
        .map(|descriptor| {
            let state = entity_state(snapshot, &descriptor.kind);
            EntityView { descriptor, state }
        })
        .collect()
}

/// A user may remove a registry device only while it is not reported
/// online. Without any snapshot everything is removable.
pub fn can_remove_device(snapshot: Option<&Snapshot>, registry_id: &str) -> bool {
    match snapshot {
        Some(s) => !s.online_registry_ids().contains(registry_id),
        None => true,
    }
}

fn kilobytes(bytes: u64) -> f64 {
    (bytes as f64 / 1024.0 * 100.0).round() / 100.0
}
