//! `firewalla query`: query a running firewalla daemon via its REST API.

use anyhow::Result;
use clap::Subcommand;

use crate::client::DaemonClient;
use crate::config;

#[derive(Subcommand)]
pub enum QueryCommands {
    /// Daemon health and per-entry summary
    Health,
    /// Last committed snapshot
    Snapshot,
    /// Entities with their current state
    Entities,
    /// Device registry entries
    Registry,
    /// Run a poll cycle now
    Refresh,
    /// Pause a firewall rule
    PauseRule { rule: String },
    /// Resume a firewall rule
    ResumeRule { rule: String },
    /// Pause an active rule, resume anything else
    ToggleRule { rule: String },
    /// Delete an alarm
    DeleteAlarm { alarm: String },
    /// Rename a device on its box
    RenameDevice { device: String, name: String },
    /// Remove an offline device from the registry
    RemoveDevice { device: String },
    /// Search alarms on the MSP API
    SearchAlarms {
        #[arg(default_value = "")]
        query: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Search flows on the MSP API
    SearchFlows {
        #[arg(default_value = "")]
        query: String,
        #[arg(long)]
        limit: Option<usize>,
    },
}

pub fn run(
    entry: &str,
    format: &str,
    url: Option<&str>,
    config_path: Option<&str>,
    command: &QueryCommands,
) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(entry, format, url, config_path, command))
}

async fn run_async(
    entry: &str,
    format: &str,
    url: Option<&str>,
    config_path: Option<&str>,
    command: &QueryCommands,
) -> Result<()> {
    let client = match url {
        Some(url) => DaemonClient::new(url)?,
        None => {
            let cfg = config::load(config_path)?;
            DaemonClient::for_addr(&cfg.daemon.http_addr)?
        }
    };

    match command {
        QueryCommands::Health => print_output(format, &client.health().await?),
        QueryCommands::Snapshot => print_output(format, &client.snapshot(entry).await?),
        QueryCommands::Entities => print_output(format, &client.entities(entry).await?),
        QueryCommands::Registry => print_output(format, &client.registry(entry).await?),
        QueryCommands::Refresh => print_output(format, &client.refresh(entry).await?),
        QueryCommands::PauseRule { rule } => {
            print_output(format, &client.rule(entry, rule, "pause").await?)
        }
        QueryCommands::ResumeRule { rule } => {
            print_output(format, &client.rule(entry, rule, "resume").await?)
        }
        QueryCommands::ToggleRule { rule } => {
            print_output(format, &client.rule(entry, rule, "toggle").await?)
        }
        QueryCommands::DeleteAlarm { alarm } => {
            print_output(format, &client.delete_alarm(entry, alarm).await?)
        }
        QueryCommands::RenameDevice { device, name } => {
            print_output(format, &client.rename_device(entry, device, name).await?)
        }
        QueryCommands::RemoveDevice { device } => {
            print_output(format, &client.remove_device(entry, device).await?)
        }
        QueryCommands::SearchAlarms { query, limit } => {
            print_output(format, &client.search_alarms(entry, query, *limit).await?)
        }
        QueryCommands::SearchFlows { query, limit } => {
            print_output(format, &client.search_flows(entry, query, *limit).await?)
        }
    }
}

fn print_output<T: serde::Serialize>(format: &str, data: &T) -> Result<()> {
    match format {
        "json" => {
            let json = serde_json::to_string_pretty(data)?;
            println!("{}", json);
        }
        _ => {
            let value = serde_json::to_value(data)?;
            print_value(&value, 0);
        }
    }
    Ok(())
}

fn print_value(value: &serde_json::Value, indent: usize) {
    let pad = "  ".repeat(indent);
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map {
                match val {
                    serde_json::Value::Object(_) => {
                        println!("{}{}:", pad, key);
                        print_value(val, indent + 1);
                    }
                    serde_json::Value::Array(arr) if arr.is_empty() => {
                        println!("{}{}: []", pad, key);
                    }
                    serde_json::Value::Array(arr)
                        if arr.iter().all(|v| !v.is_object() && !v.is_array()) =>
                    {
                        let items: Vec<String> = arr.iter().map(format_scalar).collect();
                        println!("{}{}: {}", pad, key, items.join(", "));
                    }
                    serde_json::Value::Array(_) => {
                        println!("{}{}:", pad, key);
                        print_value(val, indent + 1);
                    }
                    _ => println!("{}{}: {}", pad, key, format_scalar(val)),
                }
            }
        }
        serde_json::Value::Array(arr) => {
            for (i, item) in arr.iter().enumerate() {
                if item.is_object() {
                    println!("{}[{}]:", pad, i);
                    print_value(item, indent + 1);
                } else {
                    println!("{}- {}", pad, format_scalar(item));
                }
            }
        }
        _ => println!("{}{}", pad, format_scalar(value)),
    }
}

fn format_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}
