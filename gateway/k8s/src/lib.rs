//! Direct access to clusters whose API servers the gateway can reach with its
//! own credentials.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use fleet_gateway_core::{
    ApiRequest, ApiResponse, Backend, ClusterId, CredentialRef, Error, Result, WatchStream,
};
use futures::prelude::*;
use http_body_util::BodyExt;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    core::DynamicObject,
};
use tracing::{debug, trace};

/// Wraps a credentialed Kubernetes client for a single cluster.
///
/// Holds no state beyond the client handle, which is cheap to clone and safe to
/// share across tasks.
#[derive(Clone)]
pub struct DirectClient {
    cluster: ClusterId,
    client: kube::Client,
}

/// The API server's build information, as served by `/version`.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerVersion {
    pub git_version: String,
    pub platform: Option<String>,
}

// === impl DirectClient ===

impl DirectClient {
    pub fn new(cluster: ClusterId, client: kube::Client) -> Self {
        Self { cluster, client }
    }

    /// Builds a client from the kubeconfig that a credential reference names.
    pub async fn from_credential(cluster: ClusterId, credential: &CredentialRef) -> Result<Self> {
        let kubeconfig = match credential.kubeconfig.as_ref() {
            Some(path) => Kubeconfig::read_from(path),
            None => Kubeconfig::read(),
        }
        .map_err(|e| Error::Transport(format!("failed to read kubeconfig: {e}")))?;

        let options = KubeConfigOptions {
            context: credential.context.clone(),
            ..Default::default()
        };
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| Error::Transport(format!("invalid kubeconfig: {e}")))?;
        let client = kube::Client::try_from(config)?;
        Ok(Self::new(cluster, client))
    }

    pub fn cluster(&self) -> &ClusterId {
        &self.cluster
    }

    /// Fetches the API server's version. Used as a health probe.
    pub async fn version(&self) -> Result<ServerVersion> {
        self.request(ApiRequest::get("/version")).await?.json()
    }
}

impl std::fmt::Debug for DirectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectClient")
            .field("cluster", &self.cluster)
            .finish()
    }
}

#[async_trait::async_trait]
impl Backend for DirectClient {
    async fn request(&self, req: ApiRequest) -> Result<ApiResponse> {
        trace!(cluster = %self.cluster, method = %req.method, path = %req.path, "Sending request");
        let req = req.into_http()?.map(kube::client::Body::from);
        let rsp = self.client.send(req).await?;

        let (parts, body) = rsp.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| Error::Transport(format!("failed to read response body: {e}")))?
            .to_bytes();
        debug!(cluster = %self.cluster, status = %parts.status, len = body.len(), "Received response");
        ApiResponse::from_upstream(parts.status, body)
    }

    async fn watch(&self, req: ApiRequest) -> Result<WatchStream> {
        trace!(cluster = %self.cluster, path = %req.path, "Opening watch");
        let events = self
            .client
            .request_events::<DynamicObject>(req.into_http()?)
            .await?;
        Ok(events.map(|ev| ev.map_err(Error::from)).boxed())
    }
}
