use crate::{
    ingestor::{WatchHandle, WatchIngestor},
    registry::{ClusterChange, ClusterRegistry},
};
use ahash::AHashMap as HashMap;
use fleet_gateway_core::{ClusterId, ClusterStatus, ResourceType};
use parking_lot::Mutex;
use std::{collections::BTreeSet, sync::Arc};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Keeps one watch loop running per connected cluster and tracked resource.
///
/// Loops are started when a cluster becomes connected and stopped when it is
/// disconnected, errored, or removed.
#[derive(Clone, Debug)]
pub struct WatchSupervisor {
    registry: Arc<ClusterRegistry>,
    ingestor: WatchIngestor,
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    resources: BTreeSet<ResourceType>,
    loops: HashMap<ClusterId, HashMap<ResourceType, WatchHandle>>,
}

impl WatchSupervisor {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        ingestor: WatchIngestor,
        resources: impl IntoIterator<Item = ResourceType>,
    ) -> Self {
        let state = State {
            resources: resources.into_iter().collect(),
            loops: HashMap::default(),
        };
        Self {
            registry,
            ingestor,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Watches a resource on every connected cluster.
    pub fn track(&self, resource: ResourceType) {
        if self.state.lock().resources.insert(resource.clone()) {
            info!(%resource, "Tracking resource");
            self.resync();
        }
    }

    /// Stops watching a resource everywhere.
    pub fn untrack(&self, resource: &ResourceType) {
        let mut state = self.state.lock();
        if !state.resources.remove(resource) {
            return;
        }
        info!(%resource, "Untracking resource");
        for loops in state.loops.values_mut() {
            if let Some(handle) = loops.remove(resource) {
                handle.stop();
            }
        }
    }

    /// Lists the running watch loops.
    pub fn active(&self) -> Vec<(ClusterId, ResourceType)> {
        let state = self.state.lock();
        let mut active = state
            .loops
            .iter()
            .flat_map(|(cluster, loops)| {
                loops
                    .iter()
                    .filter(|(_, handle)| !handle.is_finished())
                    .map(move |(resource, _)| (cluster.clone(), resource.clone()))
            })
            .collect::<Vec<_>>();
        active.sort();
        active
    }

    /// Follows registry changes until shutdown, then stops every loop.
    pub async fn run(self, drain: drain::Watch) {
        let mut changes = self.registry.changes();
        self.resync();

        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                release = &mut shutdown => {
                    self.stop_all();
                    drop(release);
                    return;
                }
                change = changes.recv() => match change {
                    Ok(ClusterChange { cluster, kind }) => {
                        debug!(%cluster, ?kind, "Cluster changed");
                        self.sync_cluster(&cluster);
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "Missed cluster changes; resyncing");
                        self.resync();
                    }
                    Err(RecvError::Closed) => {
                        self.stop_all();
                        return;
                    }
                },
            }
        }
    }

    fn resync(&self) {
        let mut ids = self
            .registry
            .list()
            .into_iter()
            .map(|c| c.id)
            .collect::<BTreeSet<_>>();
        ids.extend(self.state.lock().loops.keys().cloned());
        for id in ids {
            self.sync_cluster(&id);
        }
    }

    fn sync_cluster(&self, id: &ClusterId) {
        let connected = self
            .registry
            .get(id)
            .is_some_and(|c| c.status == ClusterStatus::Connected);

        let mut state = self.state.lock();
        if !connected {
            if let Some(loops) = state.loops.remove(id) {
                debug!(cluster = %id, loops = loops.len(), "Stopping watches");
                for (_, handle) in loops {
                    handle.stop();
                }
            }
            return;
        }

        let State { resources, loops } = &mut *state;
        let loops = loops.entry(id.clone()).or_default();
        for resource in resources.iter() {
            let running = loops.get(resource).is_some_and(|h| !h.is_finished());
            if !running {
                debug!(cluster = %id, %resource, "Starting watch");
                let handle = self.ingestor.spawn(id.clone(), resource.clone());
                loops.insert(resource.clone(), handle);
            }
        }
    }

    fn stop_all(&self) {
        let loops = std::mem::take(&mut self.state.lock().loops);
        for (_, handle) in loops.into_iter().flat_map(|(_, loops)| loops) {
            handle.stop();
        }
        debug!("Stopped all watches");
    }
}
