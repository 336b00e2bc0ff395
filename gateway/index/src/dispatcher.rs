use crate::{metrics::DispatchMetrics, registry::ClusterRegistry};
use bytes::Bytes;
use fleet_gateway_core::{
    ApiRequest, ApiResponse, Backend, ClusterId, ResourceRoute, ResourceType, Result, WatchStream,
};
use http::Method;
use std::sync::Arc;
use tracing::{debug, trace};

/// Routes resource operations to a cluster, however it is connected.
///
/// Responses have the same shape on both paths. Nothing is retried here;
/// retries are a caller's policy.
#[derive(Clone, Debug)]
pub struct ProxyDispatcher {
    registry: Arc<ClusterRegistry>,
    metrics: DispatchMetrics,
}

impl ProxyDispatcher {
    pub fn new(registry: Arc<ClusterRegistry>, metrics: DispatchMetrics) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    /// Performs an operation on a resource or collection.
    ///
    /// Fails immediately if the cluster is unknown or its agent is not
    /// connected; agent-mode requests are bounded by the tunnel's request
    /// timeout.
    pub async fn dispatch(
        &self,
        cluster: &ClusterId,
        route: &ResourceRoute,
        method: Method,
        body: Bytes,
    ) -> Result<ApiResponse> {
        let path = match route.path() {
            Ok(path) => path,
            Err(error) => {
                self.metrics.rejected(&error);
                return Err(error);
            }
        };
        self.send(cluster, ApiRequest::new(method, path).body(body))
            .await
    }

    /// Sends a prepared request, e.g. one carrying a query string.
    pub async fn send(&self, cluster: &ClusterId, req: ApiRequest) -> Result<ApiResponse> {
        let backend = match self.registry.backend(cluster) {
            Ok(backend) => backend,
            Err(error) => {
                debug!(%cluster, %error, "Cluster unavailable");
                self.metrics.rejected(&error);
                return Err(error);
            }
        };
        trace!(%cluster, mode = %backend.mode(), method = %req.method, path = %req.path, "Dispatching");
        let res = backend.request(req).await;
        self.metrics.dispatched(backend.mode(), &res);
        res
    }

    /// Opens a watch over a resource, optionally scoped to a namespace and
    /// resuming from a resource version.
    pub async fn watch(
        &self,
        cluster: &ClusterId,
        resource: &ResourceType,
        namespace: Option<&str>,
        resource_version: Option<&str>,
    ) -> Result<WatchStream> {
        let backend = self.registry.backend(cluster)?;
        trace!(%cluster, mode = %backend.mode(), %resource, ?resource_version, "Watching");
        backend
            .watch(resource.watch_request(namespace, resource_version))
            .await
    }
}
