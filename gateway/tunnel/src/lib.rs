//! The gateway's end of the tunnels that in-cluster agents dial.
//!
//! An agent opens a long-lived connection, identifies its cluster with a hello
//! frame, and then executes the API requests the gateway sends it. Requests
//! are multiplexed over the connection and matched to their responses by
//! correlation ID.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod acceptor;
pub mod codec;
mod metrics;
pub mod proto;
mod session;

#[cfg(test)]
mod tests;

pub use self::{
    acceptor::{Acceptor, AttachAgent},
    codec::FrameCodec,
    metrics::TunnelMetrics,
    session::{AgentSession, CloseReason, SessionConfig},
};
