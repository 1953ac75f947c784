//! Usage Agent - periodic cluster resource usage collector
//!
//! Every collection interval this binary samples pod CPU and memory from each
//! registered cluster, rolls them up per namespace and per cluster, and keeps
//! the last half hour of snapshots in a TTL cache served over HTTP.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use usage_lib::{
    cache::{run_sweeper, MemoryStore, TimeBucketCache},
    clock::{Clock, SystemClock},
    collector::{KubeConnector, KubeConnectorConfig},
    format::format_duration,
    health::HealthRegistry,
    observability::{StructuredLogger, UsageMetrics},
    registry::FileRegistry,
    scheduler::UsageSchedulerBuilder,
};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cluster resource usage collector
#[derive(Parser)]
#[command(name = "usage-agent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, env = "USAGE_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Run a single tick, print its report as JSON and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = config::AgentConfig::load(cli.config.as_deref())?;
    info!(
        instance = %config.instance_name,
        registry = %config.registry_path.display(),
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let metrics = UsageMetrics::new();
    let logger = StructuredLogger::new(&config.instance_name);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let cache = TimeBucketCache::new(store.clone());

    let connector = KubeConnector::new(KubeConnectorConfig {
        connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        read_timeout: Duration::from_secs(config.read_timeout_secs),
        skip_tls_verify: config.skip_tls_verify,
    });
    if config.skip_tls_verify {
        warn!("TLS verification disabled for clusters without a CA bundle");
    }

    let scheduler = Arc::new(
        UsageSchedulerBuilder::new()
            .registry(Arc::new(FileRegistry::new(&config.registry_path)))
            .connector(Arc::new(connector))
            .cache(cache.clone())
            .clock(clock.clone())
            .health(health_registry.clone())
            .logger(logger.clone())
            .config(config.scheduler())
            .build()?,
    );

    if cli.once {
        if let Some(report) = scheduler.tick().await {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        return Ok(());
    }

    logger.log_startup(
        AGENT_VERSION,
        &format_duration(scheduler.config().interval),
    );

    let (shutdown_tx, _) = broadcast::channel(1);

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics,
        cache,
        clock,
    ));

    let scheduler_handle = tokio::spawn(scheduler.clone().run(shutdown_tx.subscribe()));
    let sweeper_handle = tokio::spawn(run_sweeper(
        store,
        Duration::from_secs(config.sweep_interval_secs),
        shutdown_tx.subscribe(),
    ));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Mark agent as ready after initialization
    health_registry.set_ready(true).await;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            logger.log_shutdown("SIGINT received");
        }
        result = api_handle => {
            match result {
                Ok(Ok(())) => logger.log_shutdown("API server stopped"),
                Ok(Err(e)) => {
                    logger.log_shutdown("API server failed");
                    return Err(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());
    // A tick in flight is allowed to finish
    let _ = scheduler_handle.await;
    let _ = sweeper_handle.await;
    info!("Shutdown complete");

    Ok(())
}
