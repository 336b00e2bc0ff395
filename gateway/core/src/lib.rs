//! Shared types for the fleet gateway.
//!
//! The gateway reaches each managed cluster in exactly one of two ways:
//!
//! - **direct**: the gateway holds credentials for the cluster's API server and
//!   issues requests with an ordinary Kubernetes client;
//! - **agent**: an agent running inside the cluster dials out to the gateway and
//!   holds open a single bidirectional stream, over which the gateway multiplexes
//!   requests.
//!
//! ```text
//! [ caller ] -> [ ProxyDispatcher ] -> [ ClusterRegistry ] -+-> [ DirectClient ] -> API server
//!                                                           +-> [ AgentSession ] => agent -> API server
//!
//! [ WatchIngestor ] -> WatchEvent -> [ EventHub ] -> per-connection queues -> UI
//! ```
//!
//! This crate holds the types that flow between those components: cluster
//! records, request/response shapes, normalized watch events, the error
//! taxonomy, and the [`Backend`] trait that both transports implement.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod backend;
pub mod backoff;
pub mod cluster;
mod error;
pub mod event;
pub mod labels;
pub mod request;

pub use self::{
    backend::{Backend, RawWatchEvent, WatchStream},
    backoff::Backoff,
    cluster::{Cluster, ClusterId, ClusterStatus, ConnectionMode, CredentialRef},
    error::{Error, Result},
    event::{EventType, WatchEvent},
    request::{ApiRequest, ApiResponse, ResourceRoute, ResourceType, CORE_GROUP},
};
