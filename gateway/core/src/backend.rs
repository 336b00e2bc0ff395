use crate::{ApiRequest, ApiResponse, Result};
use futures::stream::BoxStream;
use kube::core::DynamicObject;

/// A raw change notification as the Kubernetes API emits it.
pub type RawWatchEvent = kube::core::WatchEvent<DynamicObject>;

pub type WatchStream = BoxStream<'static, Result<RawWatchEvent>>;

/// Models a way of reaching a single cluster's API server.
///
/// Implemented by the direct client and by agent sessions, so that callers never
/// branch on how a cluster is connected.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Issues a single request, surfacing the upstream status unchanged.
    async fn request(&self, req: ApiRequest) -> Result<ApiResponse>;

    /// Opens a watch. The stream ends when the server closes the watch.
    async fn watch(&self, req: ApiRequest) -> Result<WatchStream>;
}

#[async_trait::async_trait]
impl<B: Backend + ?Sized> Backend for std::sync::Arc<B> {
    async fn request(&self, req: ApiRequest) -> Result<ApiResponse> {
        (**self).request(req).await
    }

    async fn watch(&self, req: ApiRequest) -> Result<WatchStream> {
        (**self).watch(req).await
    }
}
