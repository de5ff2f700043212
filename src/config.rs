use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:9180";
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_STALE_DAYS: u32 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const SCAN_INTERVAL_RANGE: std::ops::RangeInclusive<u64> = 30..=86_400;
const STALE_DAYS_RANGE: std::ops::RangeInclusive<u32> = 1..=365;
const REQUEST_TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 1..=300;
const FLOW_LIMIT_RANGE: std::ops::RangeInclusive<u32> = 1..=500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub entries: Vec<EntryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub http_addr: String,
    pub log_level: String,
    pub storage_dir: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            log_level: "info".to_string(),
            storage_dir: None,
        }
    }
}

impl DaemonConfig {
    /// Configured directory, else `<data_dir>/firewalla`.
    pub fn storage_dir(&self) -> PathBuf {
        self.storage_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("firewalla")
        })
    }
}

/// One MSP account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    pub entry_id: String,
    pub api_token: String,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub enable_alarms: bool,
    #[serde(default)]
    pub enable_rules: bool,
    #[serde(default)]
    pub enable_flows: bool,
    #[serde(default)]
    pub enable_traffic: bool,
    #[serde(default)]
    pub enable_target_lists: bool,
    #[serde(default = "default_true")]
    pub track_devices: bool,
    #[serde(default)]
    pub box_filter: Vec<String>,
    #[serde(default = "default_stale_days")]
    pub stale_days: u32,
    #[serde(default = "default_flow_limit")]
    pub flow_limit: u32,
}

fn default_scan_interval() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

fn default_stale_days() -> u32 {
    DEFAULT_STALE_DAYS
}

fn default_flow_limit() -> u32 {
    crate::msp::fetch::DEFAULT_FLOW_LIMIT
}

impl EntryConfig {
    fn validate(&self) -> Result<()> {
        let id = &self.entry_id;
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!(
                "entry_id '{}' must be non-empty and contain only letters, digits, '-' or '_'",
                id
            );
        }
        if self.api_token.trim().is_empty() {
            bail!("entry '{}': api_token is empty", id);
        }
        if !SCAN_INTERVAL_RANGE.contains(&self.scan_interval_secs) {
            bail!(
                "entry '{}': scan_interval_secs {} outside {:?}",
                id,
                self.scan_interval_secs,
                SCAN_INTERVAL_RANGE
            );
        }
        if !STALE_DAYS_RANGE.contains(&self.stale_days) {
            bail!(
                "entry '{}': stale_days {} outside {:?}",
                id,
                self.stale_days,
                STALE_DAYS_RANGE
            );
        }
        if !REQUEST_TIMEOUT_RANGE.contains(&self.request_timeout_secs) {
            bail!(
                "entry '{}': request_timeout_secs {} outside {:?}",
                id,
                self.request_timeout_secs,
                REQUEST_TIMEOUT_RANGE
            );
        }
        if !FLOW_LIMIT_RANGE.contains(&self.flow_limit) {
            bail!(
                "entry '{}': flow_limit {} outside {:?}",
                id,
                self.flow_limit,
                FLOW_LIMIT_RANGE
            );
        }
        Ok(())
    }
}

impl Config {
    pub fn path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("could not determine config directory")?;
        Ok(config_dir.join("firewalla").join("config.yaml"))
    }

    pub fn entry(&self, entry_id: &str) -> Option<&EntryConfig> {
        self.entries.iter().find(|e| e.entry_id == entry_id)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.entries {
            entry.validate()?;
            if !seen.insert(entry.entry_id.as_str()) {
                bail!("duplicate entry_id '{}'", entry.entry_id);
            }
        }
        Ok(())
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment
            .merge(Env::prefixed("FIREWALLA_").split("__"))
            .extract()
            .context("parsing configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Load the YAML file (explicit path, or the default location if present),
/// layered under `FIREWALLA_*` environment variables.
pub fn load(path: Option<&str>) -> Result<Config> {
    let figment = match path {
        Some(p) => {
            let path = PathBuf::from(p);
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            Figment::from(Yaml::file(path))
        }
        None => {
            let path = Config::path()?;
            if path.exists() {
                Figment::from(Yaml::file(path))
            } else {
                Figment::new()
            }
        }
    };
    Config::from_figment(figment)
}
