//! CCTV snapshot relay service.
//!
//! Loads the camera roster once, then polls every camera on a fixed interval
//! and republishes its latest JPEG (or a fallback placeholder) to S3.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/relay.toml, /etc/cctv-relay/relay.toml)
//! 2. The file passed with `--config`
//! 3. Environment variables (prefixed with RELAY__)
//! 4. Command line flags
//!
//! See `config.rs` for detailed configuration options.

use anyhow::{Context, Result};
use bytes::Bytes;
use cctv_relay::config::{Config, ServiceConfig, StrategyKind};
use cctv_relay::roster;
use cctv_relay::{CycleRunner, CycleSettings, HttpFetcher, Publisher, S3Store, Strategy};
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "cctv-relay", version, about = "Relay CCTV snapshots to S3")]
struct Cli {
    /// Camera request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Use the worker pool with this many workers
    #[arg(long)]
    workers: Option<usize>,

    /// Worker topology
    #[arg(long, value_enum)]
    strategy: Option<CliStrategy>,

    /// Force debug logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Additional configuration file
    #[arg(long)]
    config: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum CliStrategy {
    PerDevice,
    Pool,
}

impl Cli {
    /// Flags win over every configuration source.
    fn apply(&self, config: &mut Config) {
        if let Some(timeout) = self.timeout {
            config.http.timeout_secs = timeout;
        }

        match self.strategy {
            Some(CliStrategy::PerDevice) => config.scheduler.strategy = StrategyKind::PerDevice,
            Some(CliStrategy::Pool) => config.scheduler.strategy = StrategyKind::Pool,
            None => {}
        }

        if let Some(workers) = self.workers {
            config.scheduler.strategy = StrategyKind::Pool;
            config.scheduler.workers = workers;
        }

        if self.verbose {
            config.service.log_level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);

    // Initialize logging
    init_tracing(&config.service)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting CCTV snapshot relay"
    );

    config.validate().context("Invalid configuration")?;

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let fallback_image = Bytes::from(
        tokio::fs::read(&config.fallback_image_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to read fallback image {}",
                    config.fallback_image_path.display()
                )
            })?,
    );

    // Load the roster once; it is not refreshed while running
    let source = roster::source_from_config(&config.roster, config.fetch_timeout())
        .context("Failed to configure roster source")?;
    let records = source.load().await.context("Failed to load device roster")?;

    let credentials = config.camera.credentials();
    let devices = roster::build_devices(
        &records,
        &config.roster.fields,
        &fallback_image,
        config.scheduler.failure_limit,
        credentials.as_ref(),
    );

    if devices.is_empty() {
        warn!("Roster produced no devices, nothing to poll");
        return Ok(());
    }

    let store = Arc::new(
        S3Store::new(&config.s3)
            .await
            .context("Failed to initialize S3 store")?,
    );
    let publisher = Arc::new(
        Publisher::new(store, config.s3.key_prefix.clone(), config.interval())
            .with_write_timeout(config.s3.timeout()),
    );
    let fetcher = Arc::new(
        HttpFetcher::from_config(&config.http).context("Failed to build camera HTTP client")?,
    );

    let runner = CycleRunner::new(
        strategy(&config),
        cycle_settings(&config),
        fetcher,
        publisher,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("Shutting down, waiting for in-flight cycles");
            shutdown.cancel();
        }
    });

    let summary = runner.run(devices, shutdown).await;

    info!(
        devices = summary.devices,
        disabled = summary.disabled,
        cycles = summary.cycles,
        panics = summary.panics,
        "Relay stopped"
    );

    Ok(())
}

fn strategy(config: &Config) -> Strategy {
    match config.scheduler.strategy {
        StrategyKind::PerDevice => Strategy::PerDevice,
        StrategyKind::Pool => Strategy::Pool {
            workers: config.scheduler.workers,
        },
    }
}

fn cycle_settings(config: &Config) -> CycleSettings {
    CycleSettings {
        interval: config.interval(),
        initial_jitter: config.initial_jitter(),
        fetch_timeout: config.fetch_timeout(),
        count_publish_failures: config.scheduler.count_publish_failures,
    }
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) -> Result<()> {
    let level = match service.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(format!("cctv_relay={},aws_config=warn", level))
    })?;

    let subscriber = tracing_subscriber::registry().with(filter);

    if service.log_format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        let source = r#"
            [s3]
            bucket = "thumbnails"

            [roster]
            file = "cameras.json"
        "#;
        config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_workers_flag_selects_pool() {
        let cli = Cli::parse_from(["cctv-relay", "--workers", "4", "--timeout", "30"]);
        let mut config = base_config();

        cli.apply(&mut config);

        assert_eq!(strategy(&config), Strategy::Pool { workers: 4 });
        assert_eq!(config.http.timeout_secs, 30);
    }

    #[test]
    fn test_defaults_without_flags() {
        let cli = Cli::parse_from(["cctv-relay", "--strategy", "per-device"]);
        let mut config = base_config();

        cli.apply(&mut config);

        assert_eq!(strategy(&config), Strategy::PerDevice);
        let settings = cycle_settings(&config);
        assert_eq!(settings.interval.as_secs(), config.scheduler.interval_secs);
        assert!(settings.count_publish_failures);
    }

    #[test]
    fn test_verbose_forces_debug() {
        let cli = Cli::parse_from(["cctv-relay", "-v"]);
        let mut config = base_config();

        cli.apply(&mut config);

        assert_eq!(config.service.log_level, "debug");
    }
}
