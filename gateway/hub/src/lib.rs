//! Fan-out of watch events to subscribed connections.
//!
//! Each connection has its own bounded queue and its own delivery task, so a
//! slow consumer only ever loses its own events.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod hub;
mod metrics;
pub mod server;
pub mod wire;


pub use self::{
    hub::{Connection, ConnectionId, EventHub, Outbound, Subscription, SubscriptionHandle},
    metrics::HubMetrics,
};
