//! `firewalla check`: verify each entry's token against the MSP API.

use std::time::Duration;

use anyhow::{bail, Result};
use colored::Colorize;

use crate::config::{self, EntryConfig};
use crate::msp::fetch;
use crate::msp::gateway::HttpGateway;

pub fn run(config_path: Option<&str>, entry: Option<&str>) -> Result<()> {
    crate::server::init_tracing("warn", false);
    let cfg = config::load(config_path)?;

    let entries: Vec<&EntryConfig> = match entry {
        Some(id) => match cfg.entry(id) {
            Some(e) => vec![e],
            None => bail!("entry '{}' not found in config", id),
        },
        None => cfg.entries.iter().collect(),
    };
    if entries.is_empty() {
        bail!("no entries configured");
    }

    let rt = tokio::runtime::Runtime::new()?;
    let failures = rt.block_on(check_all(&entries));
    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn check_all(entries: &[&EntryConfig]) -> usize {
    println!("{}", "firewalla check".bold());

    let mut failures = 0;
    for entry in entries {
        let gateway = match HttpGateway::new(
            &entry.api_token,
            entry.subdomain.as_deref(),
            Duration::from_secs(entry.request_timeout_secs),
        ) {
            Ok(gw) => gw,
            Err(e) => {
                println!("  {:<12} {} ({:#})", entry.entry_id, "error".red(), e);
                failures += 1;
                continue;
            }
        };

        match fetch::check_credentials(&gateway).await {
            Ok(()) => {
                println!("  {:<12} {}  {}", entry.entry_id, "ok".green(), gateway.base_url());
            }
            Err(e) if e.is_auth() => {
                println!("  {:<12} {}  {}", entry.entry_id, "invalid token".red(), e);
                failures += 1;
            }
            Err(e) => {
                println!("  {:<12} {}  {}", entry.entry_id, "unreachable".yellow(), e);
                failures += 1;
            }
        }
    }
    failures
}
