#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

use anyhow::{bail, Result};
use clap::Parser;
use fleet_agent::{Agent, Redial};
use fleet_gateway_core::ClusterId;
use fleet_gateway_k8s::DirectClient;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Connects a cluster to a fleet gateway
#[derive(Debug, Parser)]
#[clap(name = "fleet-agent", version, about)]
struct Args {
    #[clap(long, default_value = "fleet=info,warn", env = "FLEET_AGENT_LOG")]
    log_level: String,

    /// The gateway's agent tunnel address, as `host:port`.
    #[clap(long, env = "FLEET_AGENT_GATEWAY_ADDR")]
    gateway_addr: String,

    /// The ID under which the gateway knows this cluster.
    #[clap(long, env = "FLEET_AGENT_CLUSTER_ID")]
    cluster_id: String,

    #[clap(long, default_value = "10000")]
    heartbeat_interval_ms: u64,

    #[clap(long, default_value = "500")]
    redial_backoff_min_ms: u64,

    #[clap(long, default_value = "30000")]
    redial_backoff_max_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        gateway_addr,
        cluster_id,
        heartbeat_interval_ms,
        redial_backoff_min_ms,
        redial_backoff_max_ms,
    } = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&log_level)?)
        .init();

    if cluster_id.trim().is_empty() {
        bail!("--cluster-id must not be empty");
    }
    if heartbeat_interval_ms == 0 {
        bail!("--heartbeat-interval-ms must be positive");
    }

    let client = kube::Client::try_default().await?;
    let agent = Agent::new(
        DirectClient::new(ClusterId::from(cluster_id), client),
        Duration::from_millis(heartbeat_interval_ms),
    );
    let redial = Redial {
        min: Duration::from_millis(redial_backoff_min_ms),
        max: Duration::from_millis(redial_backoff_max_ms),
    };

    info!(cluster = %agent.cluster(), gateway = %gateway_addr, "Starting agent");
    tokio::select! {
        _ = agent.run(gateway_addr, redial) => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Shutting down");
        }
    }
    Ok(())
}
