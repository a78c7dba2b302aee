//! controller CLI: run the reconcile loop over an in-memory store.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use reconcile_rs::config::Config;
use reconcile_rs::engine::{Controller, MarkReady};
use reconcile_rs::manifest;
use reconcile_rs::server::MetricsServer;
use reconcile_rs::store::InMemoryStore;
use reconcile_rs::telemetry::metrics::MetricsRecorder;
use reconcile_rs::telemetry::{TelemetryConfig, init_telemetry};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "controller", about = "Level-triggered resource reconciler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller until Ctrl-C
    Run {
        /// Directory of resource manifests to seed the store with
        #[arg(long)]
        manifests: Option<PathBuf>,
        /// Number of concurrent workers (overrides CONTROLLER_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
        /// Metrics listen address (overrides METRICS_ADDR)
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,
    },
    /// Parse a manifest directory and print what it contains
    Validate {
        /// Directory of resource manifests
        #[arg(long)]
        manifests: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            manifests,
            workers,
            metrics_addr,
        } => cmd_run(manifests, workers, metrics_addr).await,
        Command::Validate { manifests } => cmd_validate(manifests),
    }
}

async fn cmd_run(
    manifests: Option<PathBuf>,
    workers: Option<usize>,
    metrics_addr: Option<SocketAddr>,
) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(workers) = workers {
        anyhow::ensure!(workers > 0, "--workers must be at least 1");
        config.workers = workers;
    }
    if let Some(addr) = metrics_addr {
        config.metrics_addr = addr;
    }

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "reconcile-rs".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    let store = Arc::new(InMemoryStore::new());
    if let Some(dir) = manifests {
        let loaded = manifest::load_from_dir(&dir)?;
        let created = store.seed(&loaded)?;
        info!(count = created, dir = %dir.display(), "seeded store from manifests");
    }

    let metrics = Arc::new(MetricsRecorder::new(config.controller_name.clone())?);
    let server = MetricsServer::bind(config.metrics_addr, Arc::clone(&metrics)).await?;

    let controller = Controller::new(
        store,
        Arc::new(MarkReady),
        metrics,
        config.controller_config(),
    );

    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server.serve(shutdown.clone()));

    let signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received Ctrl-C, shutting down");
        signal.cancel();
    });

    let result = controller.run(shutdown.clone()).await;
    shutdown.cancel();

    match server_task.await {
        Ok(Err(e)) => warn!("metrics server error: {e}"),
        Err(e) => warn!("metrics server task failed: {e}"),
        Ok(Ok(())) => {}
    }

    result?;
    Ok(())
}

fn cmd_validate(dir: PathBuf) -> anyhow::Result<()> {
    let manifests = manifest::load_from_dir(&dir)?;

    if manifests.is_empty() {
        println!("No resources found in {}.", dir.display());
        return Ok(());
    }

    println!("{:<40}  SPEC", "KEY");
    println!("{}", "-".repeat(80));
    for m in &manifests {
        println!("{:<40}  {}", m.key.to_string(), serde_json::to_string(&m.spec)?);
    }
    println!("\n{} resource(s)", manifests.len());
    Ok(())
}
