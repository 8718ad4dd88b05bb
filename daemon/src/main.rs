//! plugind
//!
//! Loads installed plugin bundles, provisions their environments, keeps
//! their processes alive and serves capability calls over HTTP.

mod auth;
mod config;
mod loader;
mod metrics;
mod server;

use anyhow::{Result, bail};
use clap::Parser;
use plugind_bundle::MediaBucket;
use plugind_runtime::RuntimeRegistry;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use auth::ApiKey;
use config::DaemonConfig;
use loader::PluginLoader;
use metrics::Metrics;
use server::AppState;

/// plugind - local plugin runtime daemon
#[derive(Parser, Debug)]
#[command(name = "plugind")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "plugind.toml")]
    config: String,

    /// Additional configuration overlays, applied in order
    #[arg(long = "overlay")]
    overlays: Vec<String>,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("plugind v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = DaemonConfig::load(&args.config).await?;
    info!("Loaded configuration from {}", args.config);
    for overlay in &args.overlays {
        config.load_merge(overlay).await?;
        info!("Merged configuration overlay {}", overlay);
    }

    if config.server.api_key.is_empty() {
        bail!("server.api_key must be set");
    }

    // Start metrics server
    let metrics = Metrics::new()?;
    let metrics_handle = metrics::start_server(&config.monitoring);

    let registry = RuntimeRegistry::new();
    let media = MediaBucket::open(&config.media.path).await?;
    let loader = PluginLoader::new(registry.clone(), media, config.plugin.clone(), metrics.clone());
    loader.load_all().await?;

    let listener = tokio::net::TcpListener::bind(config.server.bind).await?;
    let state = AppState::new(registry, metrics);
    let gateway = tokio::spawn(server::start_server(
        listener,
        state,
        ApiKey::new(&config.server.api_key),
    ));

    tokio::select! {
        result = gateway => {
            match result {
                Ok(Ok(())) => warn!("Gateway stopped"),
                Ok(Err(e)) => warn!("Gateway failed: {:#}", e),
                Err(e) => warn!("Gateway task failed: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    // Cleanup
    loader.shutdown().await;
    metrics_handle.abort();

    Ok(())
}
