//! Fakes for the coordinator's storage and registry seams.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::msp::records::Device;
use crate::msp::testing::FakeGateway;

use super::coordinator::{Coordinator, CoordinatorOptions};
use super::ledger::LedgerDocument;
use super::ledger_store::LedgerStore;
use super::registry::DeviceRegistry;

#[derive(Default)]
pub struct CountingStore {
    initial: Option<LedgerDocument>,
    saved: Mutex<Vec<LedgerDocument>>,
}

impl CountingStore {
    pub fn with_document(doc: LedgerDocument) -> Self {
        Self {
            initial: Some(doc),
            saved: Mutex::default(),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saved.lock().unwrap().len()
    }

    pub fn last_saved(&self) -> Option<LedgerDocument> {
        self.saved.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl LedgerStore for CountingStore {
    async fn load(&self) -> Result<Option<LedgerDocument>> {
        Ok(self.initial.clone())
    }

    async fn save(&self, doc: &LedgerDocument) -> Result<()> {
        self.saved.lock().unwrap().push(doc.clone());
        Ok(())
    }
}

/// Records every sync and detach; detach answers with a name only for
/// devices it has seen synced.
#[derive(Default)]
pub struct CountingRegistry {
    synced: Mutex<Vec<String>>,
    detached: Mutex<Vec<String>>,
}

impl CountingRegistry {
    pub fn synced(&self) -> Vec<String> {
        self.synced.lock().unwrap().clone()
    }

    pub fn detached(&self) -> Vec<String> {
        self.detached.lock().unwrap().clone()
    }
}

impl DeviceRegistry for CountingRegistry {
    fn sync(&self, devices: &[Device]) {
        let mut synced = self.synced.lock().unwrap();
        for device in devices {
            if !synced.contains(&device.id) {
                synced.push(device.id.clone());
            }
        }
    }

    fn detach(&self, device_id: &str) -> Option<String> {
        self.detached.lock().unwrap().push(device_id.to_string());
        self.synced
            .lock()
            .unwrap()
            .contains(&device_id.to_string())
            .then(|| device_id.to_string())
    }
}

pub struct Harness {
    pub gateway: Arc<FakeGateway>,
    pub store: Arc<CountingStore>,
    pub registry: Arc<CountingRegistry>,
    pub coordinator: Coordinator,
}

pub fn harness(gateway: FakeGateway, options: CoordinatorOptions) -> Harness {
    let gateway = Arc::new(gateway);
    let store = Arc::new(CountingStore::default());
    let registry = Arc::new(CountingRegistry::default());
    let coordinator = Coordinator::new(
        "test",
        gateway.clone(),
        store.clone(),
        registry.clone(),
        options,
    );
    Harness {
        gateway,
        store,
        registry,
        coordinator,
    }
}
