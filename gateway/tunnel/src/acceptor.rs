use crate::{
    codec::FrameCodec,
    metrics::TunnelMetrics,
    proto::{frame, Frame},
    session::{AgentSession, CloseReason, SessionConfig},
};
use fleet_gateway_core::{ClusterId, Error, Result};
use futures::prelude::*;
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    time,
};
use tokio_util::codec::Framed;
use tracing::{debug, info, info_span, warn, Instrument};

/// Binds agent sessions to the clusters they serve.
pub trait AttachAgent: Send + Sync + 'static {
    /// Binds a newly opened session. An error refuses the session.
    fn attach(&self, session: AgentSession) -> Result<()>;

    /// Unbinds a session that has closed, if it is still the bound one.
    fn detach(&self, session: &AgentSession);
}

/// Accepts agent connections and hands their sessions to an [`AttachAgent`].
pub struct Acceptor<A> {
    attach: Arc<A>,
    config: SessionConfig,
    hello_timeout: Duration,
    metrics: TunnelMetrics,
}

// === impl Acceptor ===

impl<A> Clone for Acceptor<A> {
    fn clone(&self) -> Self {
        Self {
            attach: self.attach.clone(),
            config: self.config.clone(),
            hello_timeout: self.hello_timeout,
            metrics: self.metrics.clone(),
        }
    }
}

impl<A: AttachAgent> Acceptor<A> {
    pub fn new(
        attach: Arc<A>,
        config: SessionConfig,
        hello_timeout: Duration,
        metrics: TunnelMetrics,
    ) -> Self {
        Self {
            attach,
            config,
            hello_timeout,
            metrics,
        }
    }

    /// Accepts agent connections until shutdown is signaled.
    pub async fn serve(self, listener: TcpListener, drain: drain::Watch) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "Agent tunnel listening");

        let shutdown = drain.clone().signaled();
        tokio::pin!(shutdown);
        loop {
            let (io, client) = tokio::select! {
                res = listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(error) => {
                        warn!(%error, "Failed to accept agent connection");
                        continue;
                    }
                },
                handle = &mut shutdown => {
                    drop(handle);
                    debug!("Agent tunnel shutting down");
                    return Ok(());
                }
            };
            if let Err(error) = io.set_nodelay(true) {
                debug!(%error, "Failed to set TCP_NODELAY");
            }

            let acceptor = self.clone();
            let drain = drain.clone();
            tokio::spawn(
                async move {
                    let session = match acceptor.accept(io).await {
                        Ok(session) => session,
                        Err(error) => {
                            info!(%error, "Agent refused");
                            return;
                        }
                    };
                    tokio::select! {
                        _ = session.closed() => {}
                        handle = drain.signaled() => {
                            session.close(CloseReason::Shutdown);
                            drop(handle);
                        }
                    }
                }
                .instrument(info_span!("agent", %client)),
            );
        }
    }

    /// Reads an agent's hello, starts its session, and binds it.
    ///
    /// Once bound, the session is unbound automatically when it closes.
    pub async fn accept<T>(&self, io: T) -> Result<AgentSession>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = Framed::new(io, FrameCodec::default());
        let hello = match time::timeout(self.hello_timeout, framed.next()).await {
            Ok(Some(Ok(Frame {
                kind: Some(frame::Kind::Hello(hello)),
            }))) => hello,
            Ok(Some(Ok(_))) => return Err(Error::Transport("expected a hello frame".into())),
            Ok(Some(Err(error))) => return Err(Error::Transport(error.to_string())),
            Ok(None) => return Err(Error::Transport("connection closed before hello".into())),
            Err(_) => return Err(Error::Timeout(self.hello_timeout)),
        };
        if hello.cluster_id.is_empty() {
            return Err(Error::Validation {
                field: "cluster id",
                reason: "empty".into(),
            });
        }

        let cluster = ClusterId::from(hello.cluster_id);
        let session = AgentSession::start(
            framed,
            cluster,
            hello.agent_version,
            self.config.clone(),
            self.metrics.clone(),
        );
        if let Err(error) = self.attach.attach(session.clone()) {
            session.close(CloseReason::Refused);
            return Err(error);
        }
        info!(
            cluster = %session.cluster(),
            session = session.id(),
            version = %session.agent_version(),
            "Agent connected"
        );

        let attach = self.attach.clone();
        let bound = session.clone();
        tokio::spawn(async move {
            let reason = bound.closed().await;
            debug!(cluster = %bound.cluster(), session = bound.id(), %reason, "Detaching agent");
            attach.detach(&bound);
        });
        Ok(session)
    }
}
