//! Snapshot: one poll cycle's merged result set.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::msp::records::{
    strip_mac_prefix, Alarm, BoxRecord, Device, Flow, Rule, SimpleStats, TargetList,
};

/// Immutable once committed; consumers only ever see whole snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub fetched_at: DateTime<Utc>,
    pub boxes: Vec<BoxRecord>,
    pub devices: Vec<Device>,
    pub rules: Vec<Rule>,
    pub alarms: Vec<Alarm>,
    pub flows: Vec<Flow>,
    pub stats: SimpleStats,
    pub target_lists: Vec<TargetList>,
}

impl Snapshot {
    /// Look a device up by id, falling back to its MAC.
    pub fn device(&self, selector: &str) -> Option<&Device> {
        let selector = strip_mac_prefix(selector);
        self.devices
            .iter()
            .find(|d| d.id == selector)
            .or_else(|| {
                self.devices
                    .iter()
                    .find(|d| d.mac.as_deref().is_some_and(|m| m.eq_ignore_ascii_case(&selector)))
            })
    }

    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Look an alarm up by id, falling back to its vendor `aid`.
    pub fn alarm(&self, selector: &str) -> Option<&Alarm> {
        self.alarms
            .iter()
            .find(|a| a.id == selector)
            .or_else(|| self.alarms.iter().find(|a| a.aid.as_deref() == Some(selector)))
    }

    pub fn device_ids(&self) -> HashSet<String> {
        self.devices.iter().map(|d| d.id.clone()).collect()
    }

    /// Registry identifiers that are currently reported online. Boxes are
    /// registered as `box_<id>`.
    pub fn online_registry_ids(&self) -> HashSet<String> {
        let devices = self
            .devices
            .iter()
            .filter(|d| d.online)
            .map(|d| d.id.clone());
        let boxes = self
            .boxes
            .iter()
            .filter(|b| b.online)
            .map(|b| format!("box_{}", b.id));
        devices.chain(boxes).collect()
    }
}
