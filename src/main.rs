use std::sync::Arc;

use clap::Parser;
use gamedeployment::cluster::remote::KubeCluster;
use gamedeployment::cluster::{ObjectClient, ObjectStore};
use gamedeployment::controller::Controller;
use gamedeployment::serve;
use tokio::sync::{mpsc, watch};
use tracing::metadata::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub mod opts;

#[tokio::main]
async fn main() {
    let opts = opts::Opts::parse();

    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(!opts.no_ansi))
        .with(log_filter)
        .init();

    info!(?opts, "Starting gamedeployment controller");
    if let Err(error) = run(opts).await {
        error!(%error, "Controller failed");
        std::process::exit(1);
    }
}

async fn run(opts: opts::Opts) -> Result<(), Box<dyn std::error::Error>> {
    let client = kube::Client::try_default().await?;
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (cluster, watches) = KubeCluster::start(client, opts.namespace.as_deref(), events_tx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(serve::serve(opts.metrics_address, shutdown_rx.clone()));

    cluster.wait_until_synced().await;
    let store: Arc<dyn ObjectStore> = cluster.clone();
    let client: Arc<dyn ObjectClient> = cluster;
    let controller = Arc::new(Controller::new(store, client, opts.controller_config()));
    let runner = tokio::spawn(Arc::clone(&controller).run(events_rx, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Received interrupt, stopping");
    shutdown_tx.send(true)?;

    runner.await?;
    server.await??;
    for watch in watches {
        watch.abort();
    }
    Ok(())
}
