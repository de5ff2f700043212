use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::api::rest::{self, AppState};
use crate::config::Config;
use crate::domain::entry::{Backoff, EntryRuntime};

/// JSON logs for the daemon, plain text for one-shot commands.
/// `RUST_LOG` wins over the configured level.
pub fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.with_writer(std::io::stderr).init();
    }
}

pub async fn run(config: Config) -> Result<()> {
    init_tracing(&config.daemon.log_level, true);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        entries = config.entries.len(),
        "Firewalla daemon starting"
    );

    if config.entries.is_empty() {
        bail!("no entries configured");
    }

    let storage_dir = config.daemon.storage_dir();
    tokio::fs::create_dir_all(&storage_dir)
        .await
        .with_context(|| format!("creating storage directory {}", storage_dir.display()))?;

    let mut runtimes = Vec::new();
    for entry in &config.entries {
        match EntryRuntime::open(entry, &storage_dir) {
            Ok(runtime) => runtimes.push(Arc::new(runtime)),
            Err(e) => {
                let detail = format!("{:#}", e);
                error!(entry_id = %entry.entry_id, error = %detail, "entry could not be opened");
            }
        }
    }
    if runtimes.is_empty() {
        bail!("no entry could be opened");
    }

    // Each entry starts on its own; an unreachable account keeps retrying
    // without holding up the others or the HTTP server.
    for runtime in &runtimes {
        tokio::spawn(start_and_poll(Arc::clone(runtime)));
    }

    let app_state = AppState::new(runtimes.clone());
    let app = rest::router(app_state).layer(TraceLayer::new_for_http());

    let http_addr = &config.daemon.http_addr;
    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding to {}", http_addr))?;

    info!(addr = %http_addr, "HTTP server listening");

    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error");

    for runtime in runtimes.iter().filter(|r| r.is_ready()) {
        runtime.coordinator.flush().await;
    }

    served?;
    info!("Firewalla daemon stopped");
    Ok(())
}

/// Bring an entry up with backoff, then poll it on its scan interval.
async fn start_and_poll(runtime: Arc<EntryRuntime>) {
    if let Err(e) = runtime.start_with_retry(Backoff::default()).await {
        error!(entry_id = %runtime.entry_id(), error = %e, "entry setup failed permanently");
        return;
    }

    let period = Duration::from_secs(runtime.config.scan_interval_secs);
    let mut interval = tokio::time::interval(period);
    // Skip the first tick, start already ran the first poll
    interval.tick().await;
    loop {
        interval.tick().await;
        match runtime.coordinator.refresh().await {
            Ok(snapshot) => {
                info!(
                    entry_id = %runtime.entry_id(),
                    boxes = snapshot.boxes.len(),
                    devices = snapshot.devices.len(),
                    "periodic refresh completed"
                );
            }
            Err(e) => {
                warn!(entry_id = %runtime.entry_id(), error = %e, "periodic refresh failed");
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, shutting down"); },
        _ = terminate => { info!("Received SIGTERM, shutting down"); },
    }
}
