//! procmon - per-service I/O and resource accounting agent.

use anyhow::Result;
use clap::Parser;
use procmon::{app::App, cli::Cli, config::Config};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(err) => {
            tracing_subscriber::fmt().with_env_filter(EnvFilter::new("error")).init();
            error!("Failed to load configuration: {:#}", err);
            std::process::exit(1);
        }
    };

    // RUST_LOG, when set, takes precedence over the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("procmon starting up...");
    info!("-------------------- Configuration --------------------");
    info!("Log Level: {}", config.log_level);
    info!("Process Names: {:?}", config.monitor.process_names);
    info!("Process Lister: {:?}", config.monitor.lister);
    info!("Refresh Interval: {}s", config.monitor.refresh_interval_seconds);
    info!("Sample Interval: {}s", config.monitor.sample_interval_seconds);
    info!("Queue Capacity: {}", config.monitor.queue_capacity);
    info!("Duration Averaging: {:?}", config.monitor.duration_averaging);
    info!(
        "Collector: {}",
        config.report.collector_url.as_deref().unwrap_or("stdout")
    );
    info!(
        "Metrics: {}",
        if config.metrics.enabled {
            config.metrics.listen_address.to_string()
        } else {
            "Disabled".to_string()
        }
    );
    info!("-------------------------------------------------------");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = App::builder(config).build(shutdown_rx).await?;

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down."),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        shutdown_tx.send(true).ok();
    });

    app.run().await
}
