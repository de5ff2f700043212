//! Device registry: the host-side record of devices attached to an entry.
//!
//! The coordinator syncs entries from every committed snapshot and detaches
//! the ones whose device went stale. Users remove entries by hand through
//! `MemoryRegistry::remove`.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::msp::records::Device;

pub trait DeviceRegistry: Send + Sync {
    /// Create or refresh entries for the devices of a committed snapshot.
    fn sync(&self, devices: &[Device]);

    /// Detach a device's entry. Returns its display name if one existed.
    fn detach(&self, device_id: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub device_id: String,
    pub name: String,
    pub first_seen: DateTime<Utc>,
    pub last_synced: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryRegistry {
    entries: RwLock<BTreeMap<String, RegistryEntry>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, device_id: &str) -> Option<RegistryEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
    }

    /// Manual removal by the user.
    pub fn remove(&self, device_id: &str) -> Option<RegistryEntry> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device_id)
    }
}

impl DeviceRegistry for MemoryRegistry {
    fn sync(&self, devices: &[Device]) {
        let now = Utc::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for device in devices {
            entries
                .entry(device.id.clone())
                .and_modify(|e| {
                    e.name = device.display_name();
                    e.last_synced = now;
                })
                .or_insert_with(|| RegistryEntry {
                    device_id: device.id.clone(),
                    name: device.display_name(),
                    first_seen: now,
                    last_synced: now,
                });
        }
    }

    fn detach(&self, device_id: &str) -> Option<String> {
        self.remove(device_id).map(|e| e.name)
    }
}
