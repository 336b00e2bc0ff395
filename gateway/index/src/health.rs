use crate::registry::ClusterRegistry;
use fleet_gateway_core::{ClusterStatus, Error};
use fleet_gateway_k8s::DirectClient;
use futures::future;
use std::{sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, info, warn};

/// Periodically checks that direct-mode clusters' API servers answer.
#[derive(Clone, Debug)]
pub struct HealthProber {
    registry: Arc<ClusterRegistry>,
    interval: Duration,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(registry: Arc<ClusterRegistry>, interval: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            timeout,
        }
    }

    pub async fn run(self, drain: drain::Watch) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                release = &mut shutdown => {
                    debug!("Health probes stopped");
                    drop(release);
                    return;
                }
                _ = interval.tick() => self.probe_all().await,
            }
        }
    }

    /// Probes every direct cluster once, concurrently.
    pub async fn probe_all(&self) {
        let clients = self.registry.direct_clients();
        future::join_all(clients.iter().map(|c| self.probe(c))).await;
    }

    /// Probes a single cluster and records the result. Returns the status the
    /// probe observed.
    pub async fn probe(&self, client: &DirectClient) -> ClusterStatus {
        let id = client.cluster();
        let status = match time::timeout(self.timeout, client.version()).await {
            Ok(Ok(version)) => {
                debug!(cluster = %id, version = %version.git_version, "Probe succeeded");
                ClusterStatus::Connected
            }
            Ok(Err(error)) => {
                warn!(cluster = %id, %error, "Probe failed");
                ClusterStatus::Error
            }
            Err(_) => {
                warn!(cluster = %id, error = %Error::Timeout(self.timeout), "Probe failed");
                ClusterStatus::Error
            }
        };
        match self.registry.set_status(id, status) {
            Ok(true) => info!(cluster = %id, %status, "Cluster status changed"),
            Ok(false) => {}
            // Removed while probing.
            Err(error) => debug!(cluster = %id, %error, "Discarding probe result"),
        }
        status
    }
}
