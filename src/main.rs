use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use sdn_agent::Result;
use sdn_agent::agent::Agent;
use sdn_agent::config::Config;
use sdn_agent::model::NetworkModel;
use sdn_agent::netlink::NetworkMonitor;

/// Eden-SDN configuration agent.
#[derive(Debug, Parser)]
#[command(name = "sdn-agent", version)]
struct Args {
    /// Address of the management API.
    #[arg(long, default_value = "0.0.0.0:6666")]
    listen: SocketAddr,

    /// Agent settings (JSON); defaults apply without it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Network model to apply at startup.
    #[arg(long)]
    model: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sdn_agent=info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    info!("starting sdn-agent");

    let config = Arc::new(Config::load(args.config.as_deref())?);
    let monitor = NetworkMonitor::new(config.event_buffer)?;
    let watcher = monitor.start();
    let agent = Arc::new(Agent::new(config.clone(), monitor));

    if let Some(path) = &args.model {
        let raw = tokio::fs::read(path).await?;
        let model: NetworkModel = serde_json::from_slice(&raw)?;
        agent.apply_model(model).await?;
        info!(path = %path.display(), "initial network model applied");
    }
    tokio::spawn(agent.clone().watch_interfaces());

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!(listen = %args.listen, "serving management API");
    axum::serve(listener, sdn_agent::http::router(agent))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    watcher.abort();
    info!("sdn-agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {e}");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to wait for ctrl-c: {e}");
            }
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received ctrl-c"),
        _ = term.recv() => info!("received SIGTERM"),
    }
}
