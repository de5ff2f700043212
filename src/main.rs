mod api;
mod client;
mod commands;
mod config;
mod domain;
mod msp;
mod server;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "firewalla",
    version,
    about = "Firewalla MSP polling daemon with stale-device cleanup"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the polling daemon (one coordinator per entry + REST API)
    Daemon {
        /// HTTP listen address (overrides config)
        #[arg(long)]
        http_addr: Option<String>,

        /// Log level (overrides config)
        #[arg(long)]
        log_level: Option<String>,

        /// Path to config file (default: ~/.config/firewalla/config.yaml)
        #[arg(long)]
        config: Option<String>,
    },

    /// Verify API tokens for the configured entries
    Check {
        /// Path to config file
        #[arg(long)]
        config: Option<String>,

        /// Only check this entry
        #[arg(long)]
        entry: Option<String>,
    },

    /// Query a firewalla daemon's REST API
    Query {
        /// Entry id to query
        entry: String,

        /// Output format (table or json)
        #[arg(long, global = true, default_value = "table")]
        format: String,

        /// Daemon base URL (default: http://<daemon.http_addr> from config)
        #[arg(long, global = true)]
        url: Option<String>,

        /// Path to config file
        #[arg(long, global = true)]
        config: Option<String>,

        #[command(subcommand)]
        command: commands::query::QueryCommands,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            http_addr,
            log_level,
            config,
        } => commands::daemon::run(http_addr, log_level, config),
        Commands::Check { config, entry } => {
            commands::check::run(config.as_deref(), entry.as_deref())
        }
        Commands::Query {
            entry,
            format,
            url,
            config,
            command,
        } => commands::query::run(
            &entry,
            &format,
            url.as_deref(),
            config.as_deref(),
            &command,
        ),
    }
}
