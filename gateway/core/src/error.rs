use crate::cluster::ClusterId;
use bytes::Bytes;
use http::StatusCode;
use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("cluster {0} not found")]
    ClusterNotFound(ClusterId),

    #[error("agent for cluster {0} is not connected")]
    AgentNotConnected(ClusterId),

    #[error("cluster {0} is not reachable directly")]
    NotDirect(ClusterId),

    #[error("cluster {0} is already registered")]
    AlreadyExists(ClusterId),

    /// The stream carrying the request failed before a response arrived.
    #[error("transport failed: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The cluster's API server answered with a non-success status.
    #[error("upstream responded with {status}")]
    Upstream { status: StatusCode, body: Bytes },

    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("unknown subscriber connection {0}")]
    UnknownConnection(u64),
}

// === impl Error ===

impl Error {
    pub(crate) fn invalid(field: &'static str, reason: impl ToString) -> Self {
        Self::Validation {
            field,
            reason: reason.to_string(),
        }
    }

    /// The HTTP status an API layer should answer with for this error.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::ClusterNotFound(_) | Self::UnknownConnection(_) => StatusCode::NOT_FOUND,
            Self::AgentNotConnected(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotDirect(_) | Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream { status, .. } => *status,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
        }
    }

    /// Indicates whether the cluster itself is gone or unreachable, as opposed to
    /// a failure of a single request.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::ClusterNotFound(_) | Self::AgentNotConnected(_))
    }
}

impl From<kube::Error> for Error {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => Self::Upstream {
                status: StatusCode::from_u16(response.code)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                body: Bytes::from(response.message.clone()),
            },
            error => Self::Transport(error.to_string()),
        }
    }
}
