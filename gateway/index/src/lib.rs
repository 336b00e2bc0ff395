//! The gateway's view of its clusters.
//!
//! [`ClusterRegistry`] owns every cluster record and the direct client or agent
//! session through which it is reached. [`ProxyDispatcher`] routes operations
//! through the registry without caring which transport a cluster uses, and
//! [`WatchIngestor`] turns watches into events published on the hub.
//! [`WatchSupervisor`] keeps those watches running while clusters are connected.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod dispatcher;
mod health;
mod ingestor;
mod metrics;
mod registry;
mod supervisor;


pub use self::{
    dispatcher::ProxyDispatcher,
    health::HealthProber,
    ingestor::{WatchConfig, WatchHandle, WatchIngestor, WatchState},
    metrics::{DispatchMetrics, WatchMetrics},
    registry::{ChangeKind, ClusterBackend, ClusterChange, ClusterRegistry, Registration},
    supervisor::WatchSupervisor,
};
