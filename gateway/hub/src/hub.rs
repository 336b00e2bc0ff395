use crate::metrics::HubMetrics;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use fleet_gateway_core::{labels, ClusterId, Error, ResourceType, Result, WatchEvent};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Fans out watch events to the connections that subscribed to them.
///
/// Each connection owns a bounded queue. Publishing never waits on a queue: an
/// event that does not fit is dropped for that connection only.
#[derive(Clone, Debug)]
pub struct EventHub {
    index: Arc<RwLock<Index>>,
    capacity: usize,
    metrics: HubMetrics,
}

/// A consumer of events, e.g. a UI connection.
///
/// Dropping the connection removes all of its subscriptions.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    hub: EventHub,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

/// Identifies a single subscription held by a connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    connection: ConnectionId,
    id: u64,
}

/// A connection's interest in a cluster's resources.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub cluster: ClusterId,
    pub resource: ResourceType,

    /// Restricts the subscription to a single namespace. `None` (or an empty
    /// namespace) matches all namespaces.
    pub namespace: Option<String>,

    pub selector: labels::Selector,
}

/// Messages queued for delivery to a connection.
#[derive(Clone, Debug)]
pub enum Outbound {
    Event(Arc<WatchEvent>),
    Subscribed { id: String },
    Unsubscribed { id: String },
    Error { id: Option<String>, message: String },
}

#[derive(Debug, Default)]
struct Index {
    by_cluster: HashMap<ClusterId, HashMap<ResourceType, HashMap<SubscriptionHandle, Filter>>>,
    connections: HashMap<ConnectionId, ConnectionState>,
    next_connection: u64,
    next_subscription: u64,
}

#[derive(Debug)]
struct ConnectionState {
    tx: mpsc::Sender<Outbound>,
    subscriptions: HashMap<SubscriptionHandle, Subscription>,
}

#[derive(Debug)]
struct Filter {
    namespace: Option<String>,
    selector: labels::Selector,
}

// === impl EventHub ===

impl EventHub {
    /// Creates a hub whose connections each buffer up to `capacity` messages.
    pub fn new(capacity: usize, metrics: HubMetrics) -> Self {
        Self {
            index: Default::default(),
            capacity: capacity.max(1),
            metrics,
        }
    }

    /// Registers a new connection and returns it with the receiving end of its
    /// queue.
    pub fn connect(&self) -> (Connection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = {
            let mut index = self.index.write();
            index.next_connection += 1;
            let id = ConnectionId(index.next_connection);
            index.connections.insert(
                id,
                ConnectionState {
                    tx: tx.clone(),
                    subscriptions: HashMap::default(),
                },
            );
            id
        };
        self.metrics.connected();
        debug!(connection = id.0, "Connected");

        let conn = Connection {
            id,
            tx,
            hub: self.clone(),
        };
        (conn, rx)
    }

    /// Adds a subscription for a connection.
    ///
    /// Subscriptions are deduplicated by cluster, resource, and namespace: if the
    /// connection already holds an equivalent subscription, its handle is
    /// returned and the new selector is ignored.
    pub fn subscribe(
        &self,
        connection: ConnectionId,
        subscription: Subscription,
    ) -> Result<SubscriptionHandle> {
        let subscription = subscription.normalized();
        let mut index = self.index.write();
        let index = &mut *index;

        let conn = index
            .connections
            .get_mut(&connection)
            .ok_or(Error::UnknownConnection(connection.0))?;
        if let Some((handle, _)) = conn
            .subscriptions
            .iter()
            .find(|(_, s)| s.same_target(&subscription))
        {
            trace!(connection = connection.0, id = handle.id, "Subscription exists");
            return Ok(*handle);
        }

        index.next_subscription += 1;
        let handle = SubscriptionHandle {
            connection,
            id: index.next_subscription,
        };
        index
            .by_cluster
            .entry(subscription.cluster.clone())
            .or_default()
            .entry(subscription.resource.clone())
            .or_default()
            .insert(
                handle,
                Filter {
                    namespace: subscription.namespace.clone(),
                    selector: subscription.selector.clone(),
                },
            );
        debug!(
            connection = connection.0,
            id = handle.id,
            cluster = %subscription.cluster,
            resource = %subscription.resource,
            namespace = subscription.namespace.as_deref().unwrap_or(""),
            "Subscribed"
        );
        conn.subscriptions.insert(handle, subscription);
        self.metrics.subscribed();
        Ok(handle)
    }

    /// Removes a subscription. Returns false if it did not exist.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut index = self.index.write();
        let Some(subscription) = index
            .connections
            .get_mut(&handle.connection)
            .and_then(|conn| conn.subscriptions.remove(handle))
        else {
            return false;
        };
        index.remove_filter(handle, &subscription);
        self.metrics.unsubscribed(1);
        debug!(connection = handle.connection.0, id = handle.id, "Unsubscribed");
        true
    }

    /// Removes a connection and all of its subscriptions.
    pub fn disconnect(&self, connection: ConnectionId) {
        let mut index = self.index.write();
        let Some(conn) = index.connections.remove(&connection) else {
            return;
        };
        for (handle, subscription) in conn.subscriptions.iter() {
            index.remove_filter(handle, subscription);
        }
        self.metrics.unsubscribed(conn.subscriptions.len());
        self.metrics.disconnected();
        debug!(connection = connection.0, "Disconnected");
    }

    /// Enqueues an event for every connection with a matching subscription.
    ///
    /// A connection receives an event at most once, even if several of its
    /// subscriptions match it.
    pub fn publish(&self, event: WatchEvent) {
        self.metrics.published();
        let event = Arc::new(event);

        let mut closed = Vec::new();
        {
            let index = self.index.read();
            let Some(subscriptions) = index
                .by_cluster
                .get(&event.cluster)
                .and_then(|resources| resources.get(&event.resource))
            else {
                return;
            };

            let mut seen = HashSet::default();
            for (handle, filter) in subscriptions.iter() {
                if !filter.matches(&event) || !seen.insert(handle.connection) {
                    continue;
                }
                let Some(conn) = index.connections.get(&handle.connection) else {
                    continue;
                };
                match conn.tx.try_send(Outbound::Event(event.clone())) {
                    Ok(()) => self.metrics.delivered(),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!(connection = handle.connection.0, "Queue full; dropping event");
                        self.metrics.dropped();
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(handle.connection),
                }
            }
        }

        for connection in closed {
            self.disconnect(connection);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.index.read().connections.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.index
            .read()
            .connections
            .values()
            .map(|conn| conn.subscriptions.len())
            .sum()
    }
}

// === impl Index ===

impl Index {
    fn remove_filter(&mut self, handle: &SubscriptionHandle, subscription: &Subscription) {
        let Some(resources) = self.by_cluster.get_mut(&subscription.cluster) else {
            return;
        };
        if let Some(handles) = resources.get_mut(&subscription.resource) {
            handles.remove(handle);
            if handles.is_empty() {
                resources.remove(&subscription.resource);
            }
        }
        if resources.is_empty() {
            self.by_cluster.remove(&subscription.cluster);
        }
    }
}

// === impl Connection ===

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn subscribe(&self, subscription: Subscription) -> Result<SubscriptionHandle> {
        self.hub.subscribe(self.id, subscription)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.hub.unsubscribe(handle)
    }

    /// Queues a reply to this connection, waiting for room in its queue.
    ///
    /// Returns false if the connection's receiver has gone away.
    pub async fn reply(&self, msg: Outbound) -> bool {
        self.tx.send(msg).await.is_ok()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.hub.disconnect(self.id);
    }
}

// === impl ConnectionId ===

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// === impl SubscriptionHandle ===

impl SubscriptionHandle {
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }
}

// === impl Subscription ===

impl Subscription {
    pub fn new(cluster: ClusterId, resource: ResourceType) -> Self {
        Self {
            cluster,
            resource,
            namespace: None,
            selector: Default::default(),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn selector(mut self, selector: labels::Selector) -> Self {
        self.selector = selector;
        self
    }

    fn normalized(mut self) -> Self {
        if self.namespace.as_deref() == Some("") {
            self.namespace = None;
        }
        self
    }

    fn same_target(&self, other: &Self) -> bool {
        self.cluster == other.cluster
            && self.resource == other.resource
            && self.namespace == other.namespace
    }
}

// === impl Filter ===

impl Filter {
    fn matches(&self, event: &WatchEvent) -> bool {
        if let Some(ns) = self.namespace.as_deref() {
            if event.namespace.as_deref() != Some(ns) {
                return false;
            }
        }
        self.selector.matches(event.labels())
    }
}
