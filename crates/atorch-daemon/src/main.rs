//! ATorch Bridge - Main entry point
//!
//! Bridges ATorch devices announced over MQTT discovery into a persisted
//! accessory registry and serves its state over HTTP.

mod api;
mod config;
mod host;
mod server;
mod state;
mod ws;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Directives added when debug logging is enabled
const DEBUG_DIRECTIVES: &[&str] = &[
    "atorch_discovery=debug",
    "atorch_core=debug",
    "atorch_mqtt=debug",
];

#[derive(Parser, Debug)]
#[command(name = "atorch-bridge")]
#[command(about = "ATorch MQTT discovery bridge")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "atorch.toml")]
    config: PathBuf,

    /// Bind address for the status API
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level or filter directives (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable debug logging for the bridge crates
    #[arg(long)]
    debug: bool,
}

fn log_filter(level: &str, debug: bool) -> EnvFilter {
    let mut filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    if debug {
        for directive in DEBUG_DIRECTIVES {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
    }
    filter
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configuration decides the debug switch, so it is read before logging
    let mut config = config::load_config(&args.config)?;
    if args.debug {
        config.bridge.debug = true;
    }
    if let Some(bind) = args.bind {
        config.api.bind = bind;
    }

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&args.log_level, config.bridge.debug))
        .with_target(true)
        .init();

    info!("ATorch bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        path = %args.config.display(),
        broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
        cleanup_hours = config.bridge.cleanup,
        "Configuration loaded"
    );

    let state = state::AppState::new(config.clone()).await?;

    if config.api.enabled {
        server::run(state, &config.api.bind).await?;
    } else {
        info!("Status API disabled");
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}
