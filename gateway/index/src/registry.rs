use ahash::AHashMap as HashMap;
use chrono::Utc;
use fleet_gateway_core::{
    ApiRequest, ApiResponse, Backend, Cluster, ClusterId, ClusterStatus, ConnectionMode,
    CredentialRef, Error, Result, WatchStream,
};
use fleet_gateway_k8s::DirectClient;
use fleet_gateway_tunnel::{AgentSession, AttachAgent, CloseReason};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

const CHANGES_CAPACITY: usize = 256;

/// Holds every managed cluster and the means of reaching it.
///
/// All reads and writes go through this type's methods. Reads, issued on every
/// API call, do not block each other.
#[derive(Debug)]
pub struct ClusterRegistry {
    clusters: RwLock<HashMap<ClusterId, Entry>>,
    changes: broadcast::Sender<ClusterChange>,
}

/// Describes a cluster to be registered.
#[derive(Clone, Debug)]
pub struct Registration {
    id: ClusterId,
    display_name: String,
    link: Link,
    credential: Option<CredentialRef>,
}

/// Notifies observers of a change to the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterChange {
    pub cluster: ClusterId,
    pub kind: ChangeKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Registered(ConnectionMode),
    Status(ClusterStatus),
    Removed,
}

/// The one way a cluster is reachable at a given moment.
#[derive(Clone, Debug)]
pub enum ClusterBackend {
    Direct(DirectClient),
    Agent(AgentSession),
}

#[derive(Debug)]
struct Entry {
    cluster: Cluster,
    link: Link,
}

#[derive(Clone, Debug)]
enum Link {
    Direct(DirectClient),
    Agent(Option<AgentSession>),
}

// === impl ClusterRegistry ===

impl Default for ClusterRegistry {
    fn default() -> Self {
        Self {
            clusters: Default::default(),
            changes: broadcast::channel(CHANGES_CAPACITY).0,
        }
    }
}

impl ClusterRegistry {
    /// Adds a cluster in the `connecting` state.
    pub fn register(&self, registration: Registration) -> Result<()> {
        let Registration {
            id,
            display_name,
            link,
            credential,
        } = registration;
        let mode = link.mode();
        {
            let mut clusters = self.clusters.write();
            if clusters.contains_key(&id) {
                return Err(Error::AlreadyExists(id));
            }
            let cluster = Cluster {
                id: id.clone(),
                display_name,
                connection_mode: mode,
                credential,
                status: ClusterStatus::Connecting,
                last_seen: None,
            };
            clusters.insert(id.clone(), Entry { cluster, link });
        }
        info!(cluster = %id, %mode, "Registered cluster");
        self.notify(id, ChangeKind::Registered(mode));
        Ok(())
    }

    /// Removes a cluster, closing its agent session if it has one.
    pub fn remove(&self, id: &ClusterId) -> Result<Cluster> {
        let entry = self
            .clusters
            .write()
            .remove(id)
            .ok_or_else(|| Error::ClusterNotFound(id.clone()))?;
        if let Link::Agent(Some(session)) = &entry.link {
            session.close(CloseReason::Removed);
        }
        info!(cluster = %id, "Removed cluster");
        self.notify(id.clone(), ChangeKind::Removed);
        Ok(entry.cluster)
    }

    /// Records a cluster's status.
    ///
    /// Returns false, leaving the status unchanged, if the cluster is already in
    /// that state or may not move to it.
    pub fn set_status(&self, id: &ClusterId, status: ClusterStatus) -> Result<bool> {
        {
            let mut clusters = self.clusters.write();
            let entry = clusters
                .get_mut(id)
                .ok_or_else(|| Error::ClusterNotFound(id.clone()))?;
            if !entry.update_status(status) {
                return Ok(false);
            }
        }
        self.notify(id.clone(), ChangeKind::Status(status));
        Ok(true)
    }

    pub fn get(&self, id: &ClusterId) -> Option<Cluster> {
        self.clusters.read().get(id).map(|e| e.cluster.clone())
    }

    /// Returns a snapshot of all clusters, ordered by ID.
    pub fn list(&self) -> Vec<Cluster> {
        let mut clusters = self
            .clusters
            .read()
            .values()
            .map(|e| e.cluster.clone())
            .collect::<Vec<_>>();
        clusters.sort_by(|a, b| a.id.cmp(&b.id));
        clusters
    }

    /// Returns the client of a direct-mode cluster.
    pub fn get_direct_client(&self, id: &ClusterId) -> Result<DirectClient> {
        match self.clusters.read().get(id).map(|e| &e.link) {
            Some(Link::Direct(client)) => Ok(client.clone()),
            _ => Err(Error::NotDirect(id.clone())),
        }
    }

    /// Returns the open session of an agent-mode cluster.
    pub fn get_agent_session(&self, id: &ClusterId) -> Result<AgentSession> {
        match self.clusters.read().get(id).map(|e| &e.link) {
            None => Err(Error::ClusterNotFound(id.clone())),
            Some(Link::Agent(Some(session))) if !session.is_closed() => Ok(session.clone()),
            Some(_) => Err(Error::AgentNotConnected(id.clone())),
        }
    }

    /// Resolves the way a cluster is currently reachable, with a single lookup.
    pub fn backend(&self, id: &ClusterId) -> Result<ClusterBackend> {
        match self.clusters.read().get(id).map(|e| &e.link) {
            None => Err(Error::ClusterNotFound(id.clone())),
            Some(Link::Direct(client)) => Ok(ClusterBackend::Direct(client.clone())),
            Some(Link::Agent(Some(session))) if !session.is_closed() => {
                Ok(ClusterBackend::Agent(session.clone()))
            }
            Some(Link::Agent(_)) => Err(Error::AgentNotConnected(id.clone())),
        }
    }

    /// Returns the clients of all direct-mode clusters.
    pub fn direct_clients(&self) -> Vec<DirectClient> {
        self.clusters
            .read()
            .values()
            .filter_map(|e| match &e.link {
                Link::Direct(client) => Some(client.clone()),
                Link::Agent(_) => None,
            })
            .collect()
    }

    /// Subscribes to registry changes.
    pub fn changes(&self) -> broadcast::Receiver<ClusterChange> {
        self.changes.subscribe()
    }

    fn notify(&self, cluster: ClusterId, kind: ChangeKind) {
        // There may be no observers.
        let _ = self.changes.send(ClusterChange { cluster, kind });
    }
}

impl AttachAgent for ClusterRegistry {
    fn attach(&self, session: AgentSession) -> Result<()> {
        let id = session.cluster().clone();
        let (replaced, changed) = {
            let mut clusters = self.clusters.write();
            let entry = clusters
                .get_mut(&id)
                .ok_or_else(|| Error::ClusterNotFound(id.clone()))?;
            let Link::Agent(current) = &mut entry.link else {
                return Err(Error::Validation {
                    field: "cluster",
                    reason: format!("{id} is not an agent-mode cluster"),
                });
            };
            let replaced = current.replace(session.clone());
            entry.cluster.last_seen = Some(session.last_seen());
            (replaced, entry.update_status(ClusterStatus::Connected))
        };

        if let Some(old) = replaced {
            debug!(cluster = %id, old = old.id(), new = session.id(), "Replacing agent session");
            old.close(CloseReason::Replaced);
        }
        if changed {
            self.notify(id, ChangeKind::Status(ClusterStatus::Connected));
        }
        Ok(())
    }

    fn detach(&self, session: &AgentSession) {
        let id = session.cluster();
        let changed = {
            let mut clusters = self.clusters.write();
            let Some(entry) = clusters.get_mut(id) else {
                return;
            };
            match &mut entry.link {
                Link::Agent(current) if current.as_ref().map(|s| s.id()) == Some(session.id()) => {
                    *current = None;
                }
                // A newer session has taken over.
                _ => return,
            }
            entry.cluster.last_seen = Some(session.last_seen());
            entry.update_status(ClusterStatus::Disconnected)
        };
        info!(cluster = %id, session = session.id(), "Agent disconnected");
        if changed {
            self.notify(id.clone(), ChangeKind::Status(ClusterStatus::Disconnected));
        }
    }
}

// === impl Entry ===

impl Entry {
    fn update_status(&mut self, status: ClusterStatus) -> bool {
        let current = self.cluster.status;
        if current == status {
            return false;
        }
        if !current.can_transition_to(status) {
            debug!(cluster = %self.cluster.id, %current, %status, "Ignoring status transition");
            return false;
        }
        debug!(cluster = %self.cluster.id, from = %current, to = %status, "Status changed");
        self.cluster.status = status;
        if status == ClusterStatus::Connected {
            self.cluster.last_seen = Some(Utc::now());
        }
        true
    }
}

// === impl Registration ===

impl Registration {
    pub fn direct(id: ClusterId, display_name: impl Into<String>, client: DirectClient) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            link: Link::Direct(client),
            credential: None,
        }
    }

    pub fn agent(id: ClusterId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            link: Link::Agent(None),
            credential: None,
        }
    }

    /// Records where a direct cluster's credentials came from.
    pub fn with_credential(mut self, credential: CredentialRef) -> Self {
        self.credential = Some(credential);
        self
    }
}

// === impl Link ===

impl Link {
    fn mode(&self) -> ConnectionMode {
        match self {
            Self::Direct(_) => ConnectionMode::Direct,
            Self::Agent(_) => ConnectionMode::Agent,
        }
    }
}

// === impl ClusterBackend ===

impl ClusterBackend {
    pub fn mode(&self) -> ConnectionMode {
        match self {
            Self::Direct(_) => ConnectionMode::Direct,
            Self::Agent(_) => ConnectionMode::Agent,
        }
    }
}

#[async_trait::async_trait]
impl Backend for ClusterBackend {
    async fn request(&self, req: ApiRequest) -> Result<ApiResponse> {
        match self {
            Self::Direct(client) => client.request(req).await,
            Self::Agent(session) => session.request(req).await,
        }
    }

    async fn watch(&self, req: ApiRequest) -> Result<WatchStream> {
        match self {
            Self::Direct(client) => client.watch(req).await,
            Self::Agent(session) => session.watch(req).await,
        }
    }
}
