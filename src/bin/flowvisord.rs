//! Daemon entry point: load the config, bring up the proxy, run until
//! interrupted.

use anyhow::Context;
use clap::Parser;
use flowvisor::config::Config;
use flowvisor::topology::StaticTopology;
use flowvisor::wire::DatapathId;
use flowvisor::FlowVisor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Configuration file (JSON)
    #[arg(long, short)]
    config: PathBuf,

    /// Override the configured switch listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log filter when RUST_LOG is unset, e.g. "info" or "flowvisor=debug"
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = Config::load(&args.config)?;
    let listen = args.listen.unwrap_or(config.listen);

    let topology = Arc::new(StaticTopology::new(
        config.links.iter().map(|l| l.to_link()),
    ));
    let proxy = FlowVisor::new(topology);

    for slice in &config.slices {
        let filter = slice
            .filter
            .to_match()
            .with_context(|| format!("filter of slice dpid={}", slice.dpid))?;
        match proxy
            .add_slice(filter, slice.controller, DatapathId(slice.dpid))
            .await
        {
            Ok(id) => info!(slice = ?id, controller = %slice.controller, "slice attached"),
            // A controller that is down at startup only costs its own slice.
            Err(err) => error!(controller = %slice.controller, %err, "failed to attach slice"),
        }
    }

    let listener = proxy.listen(listen).await?;
    let sweeper = proxy.spawn_sweeper();

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    listener.abort();
    sweeper.abort();
    Ok(())
}
