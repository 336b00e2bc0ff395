//! The in-cluster end of an agent tunnel.
//!
//! The agent dials the gateway, identifies its cluster, and then executes the
//! requests the gateway sends against its own cluster's API server. Requests
//! run concurrently; a `Cancel` frame aborts the matching one.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use bytes::Bytes;
use fleet_gateway_core::{Backend, Backoff, ClusterId, Error};
use fleet_gateway_k8s::DirectClient;
use fleet_gateway_tunnel::{
    proto::{self, frame, Frame, Response},
    FrameCodec,
};
use futures::prelude::*;
use std::{collections::HashMap, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
    task::{AbortHandle, JoinSet},
    time::{self, Instant},
};
use tokio_util::codec::Framed;
use tracing::{debug, info, info_span, trace, warn, Instrument};

#[cfg(test)]
mod tests;

const OUTBOUND_CAPACITY: usize = 128;

/// The gateway echoes heartbeats, so a tunnel that stays silent for this many
/// heartbeat intervals is presumed dead.
const SILENT_INTERVALS: u32 = 3;

#[derive(Clone, Debug)]
pub struct Agent {
    client: DirectClient,
    heartbeat_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct Redial {
    pub min: Duration,
    pub max: Duration,
}

// === impl Agent ===

impl Agent {
    /// Creates an agent that serves requests with `client`, whose cluster ID is
    /// announced to the gateway.
    pub fn new(client: DirectClient, heartbeat_interval: Duration) -> Self {
        Self {
            client,
            heartbeat_interval,
        }
    }

    pub fn cluster(&self) -> &ClusterId {
        self.client.cluster()
    }

    /// Dials the gateway, serving each tunnel until it fails and redialing
    /// with backoff. Never returns.
    pub async fn run(self, gateway: String, redial: Redial) {
        let mut backoff = Backoff::new(redial.min, redial.max);
        loop {
            match TcpStream::connect(&gateway).await {
                Ok(io) => {
                    info!(%gateway, "Connected");
                    if let Err(error) = io.set_nodelay(true) {
                        debug!(%error, "Failed to set TCP_NODELAY");
                    }
                    let started = Instant::now();
                    match self.serve(io).await {
                        Ok(()) => info!("Gateway closed the tunnel"),
                        Err(error) => warn!(error = %format!("{error:#}"), "Tunnel failed"),
                    }
                    // A refused tunnel closes at once; only a lasting one resets the backoff.
                    if started.elapsed() >= redial.max {
                        backoff.reset();
                    }
                }
                Err(error) => warn!(%gateway, %error, "Failed to connect"),
            }
            let delay = backoff.next_delay();
            debug!(?delay, "Redialing");
            time::sleep(delay).await;
        }
    }

    /// Serves a single tunnel until the gateway closes it or it fails.
    pub async fn serve<T>(&self, io: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut sink, mut stream) = Framed::new(io, FrameCodec::default()).split();
        sink.send(Frame::from(frame::Kind::Hello(proto::Hello {
            cluster_id: self.cluster().to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        })))
        .await
        .context("failed to send hello")?;

        let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_CAPACITY);
        let mut writer = tokio::spawn(
            async move {
                while let Some(frame) = rx.recv().await {
                    sink.send(frame).await?;
                }
                sink.close().await
            }
            .in_current_span(),
        );

        let mut tasks = JoinSet::new();
        let mut in_flight = HashMap::<u64, AbortHandle>::new();
        let mut heartbeats = time::interval(self.heartbeat_interval);
        heartbeats.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let silent_after = self.heartbeat_interval * SILENT_INTERVALS;
        let mut last_frame = Instant::now();

        let res = loop {
            tokio::select! {
                frame = stream.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(error)) => break Err(error).context("failed to read frame"),
                        None => break Ok(()),
                    };
                    last_frame = Instant::now();
                    match frame.kind {
                        Some(frame::Kind::Request(req)) => {
                            let id = req.correlation_id;
                            trace!(id, method = %req.method, path = %req.path, watch = req.watch, "Request");
                            let task = execute(self.client.clone(), req, tx.clone())
                                .instrument(info_span!("request", id));
                            let handle = tasks.spawn(async move {
                                task.await;
                                id
                            });
                            if let Some(old) = in_flight.insert(id, handle) {
                                old.abort();
                            }
                        }
                        Some(frame::Kind::Cancel(proto::Cancel { correlation_id })) => {
                            if let Some(handle) = in_flight.remove(&correlation_id) {
                                debug!(id = correlation_id, "Cancelled");
                                handle.abort();
                            }
                        }
                        Some(frame::Kind::Heartbeat(_)) => trace!("Heartbeat"),
                        Some(frame::Kind::Hello(_) | frame::Kind::Response(_)) | None => {
                            debug!("Ignoring unexpected frame");
                        }
                    }
                }

                _ = heartbeats.tick() => {
                    if last_frame.elapsed() > silent_after {
                        break Err(anyhow::anyhow!("gateway silent for {:?}", last_frame.elapsed()));
                    }
                    if tx.send(Frame::heartbeat()).await.is_err() {
                        break Err(anyhow::anyhow!("tunnel writer stopped"));
                    }
                }

                Some(done) = tasks.join_next() => {
                    if let Ok(id) = done {
                        in_flight.remove(&id);
                    }
                }

                res = &mut writer => {
                    break match res {
                        Ok(Ok(())) => Err(anyhow::anyhow!("tunnel writer stopped")),
                        Ok(Err(error)) => Err(error).context("failed to write frame"),
                        Err(error) => Err(error).context("tunnel writer panicked"),
                    };
                }
            }
        };

        // Stop executing requests for a tunnel that is gone.
        tasks.abort_all();
        writer.abort();
        if res.is_ok() && !in_flight.is_empty() {
            debug!(in_flight = in_flight.len(), "Abandoning requests");
        }
        res
    }
}

/// Executes a tunneled request and sends its response frames.
async fn execute(client: DirectClient, req: proto::Request, tx: mpsc::Sender<Frame>) {
    let id = req.correlation_id;
    let api = match req.to_api_request() {
        Ok(api) => api,
        Err(error) => {
            let _ = tx.send(Frame::response(Response::failed(id, error))).await;
            return;
        }
    };

    if !req.watch {
        let rsp = match client.request(api).await {
            Ok(rsp) => Response::unary(id, rsp.status, rsp.body),
            Err(error) => failure(id, error),
        };
        let _ = tx.send(Frame::response(rsp)).await;
        return;
    }

    let mut events = match client.watch(api).await {
        Ok(events) => events,
        Err(error) => {
            let _ = tx.send(Frame::response(failure(id, error))).await;
            return;
        }
    };
    while let Some(event) = events.next().await {
        let rsp = match event.and_then(encode_line) {
            Ok(line) => Response::chunk(id, line),
            Err(error) => {
                let _ = tx.send(Frame::response(failure(id, error))).await;
                return;
            }
        };
        if tx.send(Frame::response(rsp)).await.is_err() {
            return;
        }
    }
    let _ = tx.send(Frame::response(Response::end(id))).await;
}

/// Relays an upstream status unchanged; anything else is a failure to reach
/// the API server at all.
fn failure(id: u64, error: Error) -> Response {
    match error {
        Error::Upstream { status, body } => Response::unary(id, status, body),
        error => Response::failed(id, error),
    }
}

fn encode_line(event: fleet_gateway_core::RawWatchEvent) -> Result<Bytes, Error> {
    let mut line = serde_json::to_vec(&event)
        .map_err(|e| Error::Transport(format!("failed to encode watch event: {e}")))?;
    line.push(b'\n');
    Ok(line.into())
}
