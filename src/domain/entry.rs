//! EntryRuntime: everything the daemon holds for one configured account.
//!
//! Construction does no I/O. `start` validates the token, restores the
//! ledger and runs the first poll; `start_with_retry` repeats it with
//! exponential backoff until it succeeds or the token is rejected.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::EntryConfig;
use crate::msp::error::ApiError;
use crate::msp::fetch;
use crate::msp::gateway::{Gateway, HttpGateway};

use super::coordinator::{Coordinator, CoordinatorOptions, PollError};
use super::entities;
use super::ledger_store::{FileLedgerStore, LedgerStore};
use super::registry::{MemoryRegistry, RegistryEntry};

#[derive(Debug, Error, PartialEq)]
pub enum RemoveError {
    #[error("device '{0}' is not in the registry")]
    NotRegistered(String),

    #[error("device '{0}' is currently online and cannot be removed")]
    Online(String),
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid API token: {0}")]
    InvalidToken(#[source] ApiError),

    #[error("cannot reach Firewalla API: {0}")]
    Unreachable(#[source] ApiError),

    #[error("first refresh failed: {0}")]
    FirstRefresh(#[from] PollError),
}

impl SetupError {
    /// A rejected token will not fix itself; everything else is retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SetupError::InvalidToken(_) | SetupError::FirstRefresh(PollError::Auth(_))
        )
    }
}

/// Delay schedule for setup retries: `initial`, doubling, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(80),
        }
    }
}

impl Backoff {
    pub fn delay(&self, tries: u32) -> Duration {
        let factor = 2u32.saturating_pow(tries.min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

pub struct EntryRuntime {
    pub config: EntryConfig,
    pub coordinator: Arc<Coordinator>,
    pub registry: Arc<MemoryRegistry>,
    ready: AtomicBool,
}

impl EntryRuntime {
    /// Build the HTTP gateway and file-backed ledger store for an entry.
    /// Only a malformed token or TLS setup can fail here.
    pub fn open(config: &EntryConfig, storage_dir: &Path) -> Result<Self> {
        let gateway = HttpGateway::new(
            &config.api_token,
            config.subdomain.as_deref(),
            Duration::from_secs(config.request_timeout_secs),
        )?;
        let store = FileLedgerStore::for_entry(storage_dir, &config.entry_id);
        info!(
            entry_id = %config.entry_id,
            base_url = %gateway.base_url(),
            ledger = %store.path().display(),
            "opening entry"
        );
        Ok(Self::new(config, Arc::new(gateway), Arc::new(store)))
    }

    pub fn new(
        config: &EntryConfig,
        gateway: Arc<dyn Gateway>,
        store: Arc<dyn LedgerStore>,
    ) -> Self {
        let registry = Arc::new(MemoryRegistry::new());
        let coordinator = Arc::new(Coordinator::new(
            config.entry_id.clone(),
            gateway,
            store,
            registry.clone(),
            CoordinatorOptions::from(config),
        ));
        Self {
            config: config.clone(),
            coordinator,
            registry,
            ready: AtomicBool::new(false),
        }
    }

    pub fn entry_id(&self) -> &str {
        &self.config.entry_id
    }

    /// True once `start` has completed a first poll.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Validate credentials, restore the ledger and run the first poll.
    pub async fn start(&self) -> Result<(), SetupError> {
        if let Err(e) = fetch::check_credentials(self.coordinator.gateway()).await {
            if e.is_auth() {
                return Err(SetupError::InvalidToken(e));
            }
            return Err(SetupError::Unreachable(e));
        }

        self.coordinator.load_store().await;
        self.coordinator.refresh().await?;
        self.ready.store(true, Ordering::Release);
        info!(entry_id = %self.entry_id(), "entry ready");
        Ok(())
    }

    /// Run `start` until it succeeds, sleeping per `backoff` after each
    /// transient failure. Returns the error once it is permanent.
    pub async fn start_with_retry(&self, backoff: Backoff) -> Result<(), SetupError> {
        let mut tries = 0;
        loop {
            match self.start().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_permanent() => return Err(e),
                Err(e) => {
                    let delay = backoff.delay(tries);
                    warn!(
                        entry_id = %self.entry_id(),
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        attempt = tries + 1,
                        "entry not ready, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    tries += 1;
                }
            }
        }
    }

    /// Manual removal from the registry, refused while the device is online.
    pub async fn remove_device(&self, registry_id: &str) -> Result<RegistryEntry, RemoveError> {
        let snapshot = self.coordinator.cached().await;
        if !entities::can_remove_device(snapshot.as_deref(), registry_id) {
            return Err(RemoveError::Online(registry_id.to_string()));
        }
        let removed = self
            .registry
            .remove(registry_id)
            .ok_or_else(|| RemoveError::NotRegistered(registry_id.to_string()))?;
        info!(entry_id = %self.entry_id(), device_id = %registry_id, "device removed by user");
        Ok(removed)
    }
}
