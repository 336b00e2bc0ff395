use chrono::{offset::Utc, DateTime};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, sync::Arc};

/// Identifies a managed cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(Arc<str>);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    Direct,
    Agent,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Points at credentials held outside of the registry.
///
/// The registry never holds key material; a direct cluster is described by the
/// kubeconfig file and context its client was built from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRef {
    /// Path to a kubeconfig file. When unset, the default kubeconfig search
    /// rules apply.
    pub kubeconfig: Option<PathBuf>,

    /// The kubeconfig context to use. When unset, the current context is used.
    pub context: Option<String>,
}

/// A snapshot of a cluster's registry record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub id: ClusterId,
    pub display_name: String,
    pub connection_mode: ConnectionMode,
    pub credential: Option<CredentialRef>,
    pub status: ClusterStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

// === impl ClusterId ===

impl ClusterId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClusterId {
    fn from(id: &str) -> Self {
        Self(id.into())
    }
}

impl From<String> for ClusterId {
    fn from(id: String) -> Self {
        Self(id.into())
    }
}

impl std::borrow::Borrow<str> for ClusterId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl ConnectionMode ===

impl ConnectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Agent => "agent",
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ClusterStatus ===

impl ClusterStatus {
    /// Indicates whether a cluster may move from this status to `next`.
    ///
    /// Clusters start out `connecting`, become `connected`, and may fall into
    /// `disconnected` or `error` from which they may reconnect. A connected
    /// cluster never moves back to `connecting`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ClusterStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Connecting, _) => true,
            (Connected, Disconnected | Error) => true,
            (Disconnected | Error, _) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
