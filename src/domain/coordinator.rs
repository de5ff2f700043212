//! Polling coordinator: one per config entry.
//!
//! Each cycle runs:
//!   fetch core → fetch optional → merge → track presence → evict stale → commit
//!
//! Cycles for one entry never overlap: the ledger lock is held for the
//! whole cycle. Readers only ever see the last committed snapshot.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::EntryConfig;
use crate::msp::error::ApiError;
use crate::msp::fetch;
use crate::msp::gateway::Gateway;
use crate::msp::records::{BoxRecord, Device};

use super::ledger::PresenceLedger;
use super::ledger_store::LedgerStore;
use super::registry::DeviceRegistry;
use super::snapshot::Snapshot;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("authentication with the Firewalla API failed: {0}")]
    Auth(#[source] ApiError),

    #[error("cannot reach Firewalla API: boxes and devices both came back empty")]
    TotalFailure,
}

/// The per-entry settings the coordinator acts on.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorOptions {
    pub enable_rules: bool,
    pub enable_alarms: bool,
    pub enable_flows: bool,
    pub enable_traffic: bool,
    pub enable_target_lists: bool,
    pub track_devices: bool,
    pub box_filter: Vec<String>,
    pub stale_days: u32,
    pub flow_limit: u32,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            enable_rules: false,
            enable_alarms: false,
            enable_flows: false,
            enable_traffic: false,
            enable_target_lists: false,
            track_devices: true,
            box_filter: Vec::new(),
            stale_days: crate::config::DEFAULT_STALE_DAYS,
            flow_limit: fetch::DEFAULT_FLOW_LIMIT,
        }
    }
}

impl From<&EntryConfig> for CoordinatorOptions {
    fn from(entry: &EntryConfig) -> Self {
        Self {
            enable_rules: entry.enable_rules,
            enable_alarms: entry.enable_alarms,
            enable_flows: entry.enable_flows,
            enable_traffic: entry.enable_traffic,
            enable_target_lists: entry.enable_target_lists,
            track_devices: entry.track_devices,
            box_filter: entry.box_filter.clone(),
            stale_days: entry.stale_days,
            flow_limit: entry.flow_limit,
        }
    }
}

pub struct Coordinator {
    entry_id: String,
    gateway: Arc<dyn Gateway>,
    store: Arc<dyn LedgerStore>,
    registry: Arc<dyn DeviceRegistry>,
    options: CoordinatorOptions,
    ledger: Mutex<PresenceLedger>,
    cache: RwLock<Option<Arc<Snapshot>>>,
}

impl Coordinator {
    pub fn new(
        entry_id: impl Into<String>,
        gateway: Arc<dyn Gateway>,
        store: Arc<dyn LedgerStore>,
        registry: Arc<dyn DeviceRegistry>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            entry_id: entry_id.into(),
            gateway,
            store,
            registry,
            options,
            ledger: Mutex::new(PresenceLedger::new()),
            cache: RwLock::new(None),
        }
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn gateway(&self) -> &dyn Gateway {
        self.gateway.as_ref()
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// The last committed snapshot, if any cycle has succeeded.
    pub async fn cached(&self) -> Option<Arc<Snapshot>> {
        self.cache.read().await.clone()
    }

    /// Restore the presence ledger from durable storage. Called once at
    /// setup, before the first refresh. A missing or unreadable document
    /// leaves the ledger empty.
    pub async fn load_store(&self) {
        self.load_store_at(Utc::now()).await
    }

    pub async fn load_store_at(&self, now: DateTime<Utc>) {
        match self.store.load().await {
            Ok(Some(doc)) => {
                let restored = PresenceLedger::restore(&doc, now, self.options.stale_days);
                if restored.is_empty() && !doc.is_empty() {
                    warn!(
                        entry_id = %self.entry_id,
                        discarded = doc.len(),
                        "every persisted device-seen timestamp was expired or unreadable"
                    );
                }
                info!(
                    entry_id = %self.entry_id,
                    devices = restored.len(),
                    "loaded device-seen timestamps"
                );
                *self.ledger.lock().await = restored;
            }
            Ok(None) => {
                debug!(entry_id = %self.entry_id, "no persisted device-seen timestamps");
            }
            Err(e) => {
                warn!(
                    entry_id = %self.entry_id,
                    error = %e,
                    "failed to load device-seen timestamps, starting empty"
                );
            }
        }
    }

    pub async fn refresh(&self) -> Result<Arc<Snapshot>, PollError> {
        self.refresh_at(Utc::now()).await
    }

    /// Out-of-cycle refresh after a mutating action. Failures are logged;
    /// the previous snapshot stays in place.
    pub async fn request_refresh(&self) {
        if let Err(e) = self.refresh().await {
            warn!(entry_id = %self.entry_id, error = %e, "requested refresh failed");
        }
    }

    /// Run one poll cycle as of `now`.
    pub async fn refresh_at(&self, now: DateTime<Utc>) -> Result<Arc<Snapshot>, PollError> {
        let mut ledger = self.ledger.lock().await;
        let previous = self.cached().await;

        let (boxes, devices) = match self.fetch_core(now).await {
            Ok(core) => core,
            Err(PollError::TotalFailure) => {
                return match previous {
                    Some(cached) => {
                        warn!(
                            entry_id = %self.entry_id,
                            "boxes and devices both empty, serving cached data"
                        );
                        Ok(cached)
                    }
                    None => {
                        error!(
                            entry_id = %self.entry_id,
                            "boxes and devices both empty and no cached data"
                        );
                        Err(PollError::TotalFailure)
                    }
                };
            }
            Err(e) => return Err(e),
        };

        let prev = previous.as_deref();
        let opts = &self.options;
        let gw = self.gateway.as_ref();

        let rules = if opts.enable_rules {
            self.with_fallback("rules", fetch::rules(gw), prev, |s| s.rules.clone())
                .await
        } else {
            Vec::new()
        };
        let alarms = if opts.enable_alarms {
            self.with_fallback("alarms", fetch::active_alarms(gw), prev, |s| s.alarms.clone())
                .await
        } else {
            Vec::new()
        };
        let flows = if opts.enable_flows {
            self.with_fallback(
                "flows",
                fetch::flows(gw, opts.flow_limit, None),
                prev,
                |s| s.flows.clone(),
            )
            .await
        } else {
            Vec::new()
        };
        let target_lists = if opts.enable_target_lists {
            self.with_fallback("target_lists", fetch::target_lists(gw), prev, |s| {
                s.target_lists.clone()
            })
            .await
        } else {
            Vec::new()
        };
        let stats = self
            .with_fallback("stats", fetch::simple_stats(gw), prev, |s| s.stats.clone())
            .await;

        let snapshot = Arc::new(Snapshot {
            fetched_at: now,
            boxes,
            devices,
            rules,
            alarms,
            flows,
            stats,
            target_lists,
        });

        let current = snapshot.device_ids();
        self.track_presence(&mut ledger, &current, now).await;
        self.evict_stale(&mut ledger, &current, now);

        *self.cache.write().await = Some(snapshot.clone());
        self.registry.sync(&snapshot.devices);

        debug!(
            entry_id = %self.entry_id,
            boxes = snapshot.boxes.len(),
            devices = snapshot.devices.len(),
            rules = snapshot.rules.len(),
            alarms = snapshot.alarms.len(),
            flows = snapshot.flows.len(),
            "poll cycle committed"
        );
        Ok(snapshot)
    }

    /// Boxes and devices, narrowed by the box filter. An auth failure on
    /// either call aborts the cycle; other failures count as empty.
    async fn fetch_core(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(Vec<BoxRecord>, Vec<Device>), PollError> {
        let gw = self.gateway.as_ref();
        let mut boxes = self.core_or_empty("boxes", fetch::boxes(gw).await)?;
        let mut devices = self.core_or_empty("devices", fetch::devices(gw, now).await)?;

        if boxes.is_empty() && devices.is_empty() {
            return Err(PollError::TotalFailure);
        }

        if !self.options.box_filter.is_empty() {
            boxes.retain(|b| self.options.box_filter.contains(&b.id));
            let allowed: HashSet<&str> = boxes.iter().map(|b| b.id.as_str()).collect();
            devices.retain(|d| d.box_gid.as_deref().is_some_and(|g| allowed.contains(g)));
        }

        Ok((boxes, devices))
    }

    fn core_or_empty<T>(
        &self,
        category: &'static str,
        result: Result<Vec<T>, ApiError>,
    ) -> Result<Vec<T>, PollError> {
        match result {
            Ok(records) => Ok(records),
            Err(e) if e.is_auth() => Err(PollError::Auth(e)),
            Err(e) => {
                warn!(entry_id = %self.entry_id, category, error = %e, "core fetch failed");
                Ok(Vec::new())
            }
        }
    }

    async fn with_fallback<T, F>(
        &self,
        category: &'static str,
        fetch: F,
        previous: Option<&Snapshot>,
        from_cache: fn(&Snapshot) -> T,
    ) -> T
    where
        T: Default,
        F: Future<Output = Result<T, ApiError>>,
    {
        match fetch.await {
            Ok(value) => value,
            Err(e) => {
                let cached = previous.map(from_cache);
                warn!(
                    entry_id = %self.entry_id,
                    category,
                    error = %e,
                    fallback = if cached.is_some() { "cache" } else { "empty" },
                    "could not fetch category"
                );
                cached.unwrap_or_default()
            }
        }
    }

    /// Stamp every current device and persist the ledger when at least one
    /// device went missing this cycle. Polls without such a transition do
    /// not write, to keep flash-backed storage from wearing out.
    async fn track_presence(
        &self,
        ledger: &mut PresenceLedger,
        current: &HashSet<String>,
        now: DateTime<Utc>,
    ) {
        let newly_absent = ledger.observe(current, now);
        if newly_absent.is_empty() {
            return;
        }

        debug!(
            entry_id = %self.entry_id,
            devices = ?newly_absent,
            "devices went absent"
        );
        self.persist(ledger).await;
    }

    /// Write the whole ledger, whether or not anything went absent.
    /// Called when the entry unloads so last-seen times refreshed since the
    /// previous absence transition survive a restart.
    pub async fn flush(&self) {
        let ledger = self.ledger.lock().await;
        self.persist(&ledger).await;
    }

    async fn persist(&self, ledger: &PresenceLedger) {
        let doc = ledger.to_document();
        match self.store.save(&doc).await {
            Ok(()) => debug!(
                entry_id = %self.entry_id,
                count = doc.len(),
                "persisted device-seen timestamps"
            ),
            Err(e) => warn!(
                entry_id = %self.entry_id,
                error = %e,
                "failed to persist device-seen timestamps"
            ),
        }
    }

    fn evict_stale(
        &self,
        ledger: &mut PresenceLedger,
        current: &HashSet<String>,
        now: DateTime<Utc>,
    ) {
        let threshold = Duration::days(i64::from(self.options.stale_days));

        for stale in ledger.stale(current, now, threshold) {
            match self.registry.detach(&stale.id) {
                Some(name) => info!(
                    entry_id = %self.entry_id,
                    device = %name,
                    device_id = %stale.id,
                    last_seen = %stale.last_seen.to_rfc3339(),
                    stale_days = self.options.stale_days,
                    "removing stale device"
                ),
                None => debug!(
                    entry_id = %self.entry_id,
                    device_id = %stale.id,
                    "stale device has no registry entry"
                ),
            }
            ledger.forget(&stale.id);
        }
    }
}
