// tracker: Follows one parcel over the tracking-events WebSocket and prints
// every reconciled view and connection-status change as a JSON line.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracker::config::load_config_from_path;
use tracker::connection::ConnectionSnapshot;
use tracker::reconciler::ViewState;
use tracker::rest::HttpTrackingApi;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tracker", version, about = "Real-time parcel tracking client")]
struct Cli {
    /// Path to the tracker config file.
    #[arg(long, global = true, default_value = "/etc/parcel-tracker/tracker.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Track one package until Ctrl-C.
    Watch {
        /// The package's tracking code.
        package_code: String,
    },
    /// Load and validate the config, then exit.
    CheckConfig,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum OutputLine<'a> {
    Connection(&'a ConnectionSnapshot),
    View(&'a ViewState),
}

fn emit(line: &OutputLine<'_>) {
    match serde_json::to_string(line) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(error = %e, "failed to serialize output line"),
    }
}

#[tokio::main]
async fn main() {
    // stdout carries the JSON lines; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Both TLS clients share one process-wide rustls provider.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("a rustls crypto provider was already installed");
    }

    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "tracker starting");

    let cfg = match load_config_from_path(&cli.config) {
        Ok(cfg) => {
            info!(
                ws_url = %cfg.tracking.ws_url,
                api = %cfg.api.base_url,
                authenticated = cfg.token.is_some(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let package_code = match cli.command {
        Commands::CheckConfig => {
            println!("config OK: {}", cli.config.display());
            return;
        }
        Commands::Watch { package_code } => package_code,
    };

    let api = match HttpTrackingApi::new(&cfg.api.base_url, cfg.token.clone()) {
        Ok(api) => api,
        Err(e) => {
            eprintln!("FATAL: failed to create API client: {}", e);
            std::process::exit(1);
        }
    };

    let (handle, session) = tracker::spawn(&cfg, api);
    let mut status = handle.connection();
    let mut view = handle.tracking();
    handle.track(package_code);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown: Ctrl-C received");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                emit(&OutputLine::Connection(&status.borrow_and_update()));
            }
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                emit(&OutputLine::View(&view.borrow_and_update()));
            }
        }
    }

    handle.close();
    drop(handle);
    if let Err(e) = session.await {
        warn!(error = %e, "tracking session task failed");
    }
    info!("tracker shutdown complete");
}
