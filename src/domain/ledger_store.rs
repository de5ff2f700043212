//! LedgerStore: durable whole-document persistence of the presence ledger.
//!
//! One document per config entry, replaced atomically on every save.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::ledger::LedgerDocument;

pub const STORAGE_KEY: &str = "firewalla.device_seen";
pub const STORAGE_VERSION: u32 = 1;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// `Ok(None)` when nothing has been persisted yet.
    async fn load(&self) -> Result<Option<LedgerDocument>>;

    async fn save(&self, doc: &LedgerDocument) -> Result<()>;
}

/// On-disk envelope, versioned like the host's `.storage/` files.
#[derive(Debug, Serialize, Deserialize)]
struct StoredLedger {
    version: u32,
    key: String,
    data: LedgerDocument,
}

pub struct FileLedgerStore {
    path: PathBuf,
    key: String,
    write_lock: Mutex<()>,
}

impl FileLedgerStore {
    pub fn new(path: PathBuf, key: String) -> Self {
        Self {
            path,
            key,
            write_lock: Mutex::new(()),
        }
    }

    /// `<storage_dir>/firewalla.device_seen_<entry_id>.json`
    pub fn for_entry(storage_dir: &Path, entry_id: &str) -> Self {
        let key = format!("{}_{}", STORAGE_KEY, entry_id);
        Self::new(storage_dir.join(format!("{}.json", key)), key)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LedgerStore for FileLedgerStore {
    async fn load(&self) -> Result<Option<LedgerDocument>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let stored: StoredLedger = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", self.path.display()))?;

        if stored.version != STORAGE_VERSION {
            bail!(
                "unsupported ledger version {} in {} (expected {})",
                stored.version,
                self.path.display(),
                STORAGE_VERSION
            );
        }

        Ok(Some(stored.data))
    }

    /// Serialize to a `.tmp` sibling, then rename over the final path so
    /// the document on disk is always complete.
    async fn save(&self, doc: &LedgerDocument) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let stored = StoredLedger {
            version: STORAGE_VERSION,
            key: self.key.clone(),
            data: doc.clone(),
        };
        let content =
            serde_json::to_string_pretty(&stored).context("failed to serialize ledger")?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &content)
            .await
            .with_context(|| format!("writing temp file {}", tmp_path.display()))?;

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| {
                format!(
                    "renaming {} to {}",
                    tmp_path.display(),
                    self.path.display()
                )
            })?;

        Ok(())
    }
}
