use crate::config;
use anyhow::{bail, Context, Result};
use clap::Parser;
use fleet_gateway_core::ResourceType;
use fleet_gateway_hub::{EventHub, HubMetrics};
use fleet_gateway_index::{
    ClusterRegistry, DispatchMetrics, HealthProber, ProxyDispatcher, WatchConfig, WatchIngestor,
    WatchMetrics, WatchSupervisor,
};
use fleet_gateway_tunnel::{Acceptor, SessionConfig, TunnelMetrics};
use futures::prelude::*;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{net::TcpListener, time::Duration};
use tracing::{info, info_span, Instrument};

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[clap(name = "fleet-gateway", about = "Reaches a fleet of Kubernetes clusters")]
pub struct Args {
    #[clap(long, default_value = "fleet=info,warn", env = "FLEET_GATEWAY_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The address on which in-cluster agents connect.
    #[clap(long, default_value = "0.0.0.0:8090")]
    agent_addr: SocketAddr,

    /// The address on which event subscribers connect.
    #[clap(long, default_value = "0.0.0.0:8091")]
    events_addr: SocketAddr,

    /// A YAML file listing the managed clusters.
    #[clap(long, env = "FLEET_GATEWAY_CLUSTERS")]
    clusters: Option<PathBuf>,

    #[clap(long, default_value = "30000")]
    request_timeout_ms: u64,

    /// Agents that send nothing for this long are disconnected. Zero disables
    /// eviction.
    #[clap(long, default_value = "45000")]
    heartbeat_timeout_ms: u64,

    #[clap(long, default_value = "256")]
    subscriber_queue_capacity: usize,

    #[clap(long, default_value = "15000")]
    health_interval_ms: u64,

    #[clap(long, default_value = "500")]
    watch_backoff_min_ms: u64,

    #[clap(long, default_value = "30000")]
    watch_backoff_max_ms: u64,

    /// Resources watched on every connected cluster, as `group/version/resource`.
    #[clap(long, default_value = "_/v1/pods,_/v1/services,apps/v1/deployments")]
    watch_resources: ResourceTypes,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            agent_addr,
            events_addr,
            clusters,
            request_timeout_ms,
            heartbeat_timeout_ms,
            subscriber_queue_capacity,
            health_interval_ms,
            watch_backoff_min_ms,
            watch_backoff_max_ms,
            watch_resources: ResourceTypes(watch_resources),
        } = self;

        if request_timeout_ms == 0 {
            bail!("--request-timeout-ms must be positive");
        }
        if subscriber_queue_capacity == 0 {
            bail!("--subscriber-queue-capacity must be positive");
        }
        let clusters = match clusters {
            Some(path) => config::load(&path)?,
            None => Vec::new(),
        };

        let mut prom = <Registry>::default();
        let tunnel_metrics = TunnelMetrics::register(prom.sub_registry_with_prefix("tunnel"));
        let hub_metrics = HubMetrics::register(prom.sub_registry_with_prefix("hub"));
        let dispatch_metrics =
            DispatchMetrics::register(prom.sub_registry_with_prefix("dispatcher"));
        let watch_metrics = WatchMetrics::register(prom.sub_registry_with_prefix("watch"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let registry = Arc::new(ClusterRegistry::default());
        config::register(&registry, clusters, &runtime.client()).await?;

        let hub = EventHub::new(subscriber_queue_capacity, hub_metrics);
        let dispatcher = ProxyDispatcher::new(registry.clone(), dispatch_metrics);
        let ingestor = WatchIngestor::new(
            dispatcher,
            hub.clone(),
            WatchConfig {
                backoff_min: Duration::from_millis(watch_backoff_min_ms),
                backoff_max: Duration::from_millis(watch_backoff_max_ms),
            },
            watch_metrics,
        );

        // Keep watches running on connected clusters.
        let supervisor = WatchSupervisor::new(registry.clone(), ingestor, watch_resources);
        tokio::spawn(
            supervisor
                .run(runtime.shutdown_handle())
                .instrument(info_span!("watches")),
        );

        // Probe direct clusters' API servers.
        let prober = HealthProber::new(
            registry.clone(),
            Duration::from_millis(health_interval_ms),
            PROBE_TIMEOUT,
        );
        tokio::spawn(
            prober
                .run(runtime.shutdown_handle())
                .instrument(info_span!("health")),
        );

        // Accept agent tunnels.
        let sessions = SessionConfig {
            request_timeout: Duration::from_millis(request_timeout_ms),
            heartbeat_timeout: (heartbeat_timeout_ms > 0)
                .then(|| Duration::from_millis(heartbeat_timeout_ms)),
            ..SessionConfig::default()
        };
        let acceptor = Acceptor::new(registry, sessions, HELLO_TIMEOUT, tunnel_metrics);
        let agents = TcpListener::bind(agent_addr)
            .await
            .with_context(|| format!("failed to bind agent listener on {agent_addr}"))?;
        tokio::spawn(
            acceptor
                .serve(agents, runtime.shutdown_handle())
                .map_err(|error| tracing::error!(%error, "Agent listener failed"))
                .instrument(info_span!("agents", port = agent_addr.port())),
        );

        // Serve event subscribers.
        let events = TcpListener::bind(events_addr)
            .await
            .with_context(|| format!("failed to bind events listener on {events_addr}"))?;
        tokio::spawn(
            fleet_gateway_hub::server::serve(events, hub, runtime.shutdown_handle())
                .map_err(|error| tracing::error!(%error, "Events listener failed"))
                .instrument(info_span!("events", port = events_addr.port())),
        );

        info!("Gateway started");

        // Runs until a shutdown signal is received and the listeners and watches have drained.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
struct ResourceTypes(Vec<ResourceType>);

impl std::str::FromStr for ResourceTypes {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().map_err(Into::into))
            .collect::<Result<Vec<ResourceType>>>()
            .map(Self)
    }
}
