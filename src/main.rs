use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gatewaylb::balancer::RequestContext;
use gatewaylb::config::Config;
use gatewaylb::{CheckerMode, ServiceManager};

/// Demonstrates the load-balancing and health-checking core end to end: it
/// loads a topology, starts health checking, and periodically prints which
/// node each configured service would currently route to. It never accepts
/// or proxies a connection — that's the job of whatever embeds this crate.
#[derive(Parser, Debug)]
#[command(name = "gatewaylb-demo")]
#[command(about = "Load-balancing core demo harness")]
#[command(version)]
struct Args {
    /// Path to a YAML topology file.
    #[arg(short, long, default_value = "demos/topology.yaml")]
    config: PathBuf,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,

    /// Validate the topology and exit without starting health checking.
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("loading topology from {:?}", args.config);
    let config = Config::load(&args.config)?;

    if args.validate {
        info!("topology is valid ({} service(s))", config.services.len());
        return Ok(());
    }

    let manager = Arc::new(ServiceManager::new(CheckerMode::Independent));
    for service in config.services {
        let id = service.id.clone();
        manager.add_service(service)?;
        info!(service_id = %id, "service registered and health checking started");
    }

    let poll_manager = manager.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            ticker.tick().await;
            for id in poll_manager.list_services() {
                let ctx = RequestContext::new("demo-client");
                match poll_manager.select_node(&id, &ctx) {
                    Ok(node) => info!(service_id = %id, node_id = %node.id, "would route to"),
                    Err(e) => warn!(service_id = %id, "no node available: {e}"),
                }
            }
        }
    });

    info!("running until ctrl-c");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    manager.close()?;

    Ok(())
}
