use crate::{
    hub::{Connection, EventHub, Outbound, Subscription, SubscriptionHandle},
    wire::{self, ClientMessage},
};
use ahash::AHashMap as HashMap;
use fleet_gateway_core::labels;
use futures::prelude::*;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::mpsc,
};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, info_span, warn, Instrument};

/// Client messages longer than this are rejected.
const MAX_LINE_LEN: usize = 64 * 1024;

/// Accepts subscriber connections until shutdown is signaled.
pub async fn serve(listener: TcpListener, hub: EventHub, drain: drain::Watch) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "Event subscribers listening");

    let shutdown = drain.clone().signaled();
    tokio::pin!(shutdown);
    loop {
        let (io, client) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept subscriber connection");
                    continue;
                }
            },
            handle = &mut shutdown => {
                drop(handle);
                return Ok(());
            }
        };

        let hub = hub.clone();
        let drain = drain.clone();
        tokio::spawn(
            async move {
                let (read, write) = io.into_split();
                tokio::select! {
                    _ = serve_connection(read, write, hub) => {}
                    handle = drain.signaled() => drop(handle),
                }
            }
            .instrument(info_span!("subscriber", %client)),
        );
    }
}

/// Serves a single subscriber until it disconnects.
///
/// Messages are read on the calling task; a dedicated task owns the write half
/// and drains the connection's queue.
pub async fn serve_connection<R, W>(read: R, write: W, hub: EventHub)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (conn, rx) = hub.connect();
    debug!(connection = %conn.id(), "Subscriber connected");
    let delivery = tokio::spawn(
        deliver(rx, FramedWrite::new(write, LinesCodec::new()))
            .instrument(info_span!("delivery", connection = %conn.id())),
    );

    let mut lines = FramedRead::new(read, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut subscriptions = HashMap::<String, SubscriptionHandle>::default();
    // The reader yields `None` once after a decode error and then resumes.
    let mut resume = false;
    loop {
        let line = match lines.next().await {
            Some(line) => line,
            None if std::mem::take(&mut resume) => continue,
            None => break,
        };
        let reply = match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => match wire::decode(&line) {
                Ok(msg) => handle(&conn, &mut subscriptions, msg),
                Err(error) => Outbound::Error {
                    id: None,
                    message: format!("invalid message: {error}"),
                },
            },
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                resume = true;
                Outbound::Error {
                    id: None,
                    message: "message too long".to_string(),
                }
            }
            Err(LinesCodecError::Io(error)) => {
                debug!(%error, "Read failed");
                break;
            }
        };
        if !conn.reply(reply).await {
            break;
        }
    }

    debug!(connection = %conn.id(), "Subscriber disconnected");
    drop(conn);
    // The queue closes once the connection is gone, ending delivery.
    let _ = delivery.await;
}

fn handle(
    conn: &Connection,
    subscriptions: &mut HashMap<String, SubscriptionHandle>,
    msg: ClientMessage,
) -> Outbound {
    match msg {
        ClientMessage::Subscribe {
            id,
            cluster_id,
            resource_type,
            namespace,
            label_selector,
        } => {
            if subscriptions.contains_key(&id) {
                return Outbound::Error {
                    message: format!("subscription {id:?} already exists"),
                    id: Some(id),
                };
            }
            let selector = match label_selector
                .as_deref()
                .unwrap_or("")
                .parse::<labels::Selector>()
            {
                Ok(selector) => selector,
                Err(error) => {
                    return Outbound::Error {
                        id: Some(id),
                        message: error.to_string(),
                    }
                }
            };
            let subscription = Subscription {
                cluster: cluster_id,
                resource: resource_type,
                namespace,
                selector,
            };
            match conn.subscribe(subscription) {
                Ok(handle) => {
                    subscriptions.insert(id.clone(), handle);
                    Outbound::Subscribed { id }
                }
                Err(error) => Outbound::Error {
                    id: Some(id),
                    message: error.to_string(),
                },
            }
        }

        ClientMessage::Unsubscribe { id } => {
            let Some(handle) = subscriptions.remove(&id) else {
                return Outbound::Error {
                    message: format!("subscription {id:?} does not exist"),
                    id: Some(id),
                };
            };
            // Equivalent subscriptions share a handle.
            if !subscriptions.values().any(|h| *h == handle) {
                conn.unsubscribe(&handle);
            }
            Outbound::Unsubscribed { id }
        }
    }
}

async fn deliver<W>(mut rx: mpsc::Receiver<Outbound>, mut sink: FramedWrite<W, LinesCodec>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let line = match wire::encode(&msg) {
            Ok(line) => line,
            Err(error) => {
                warn!(%error, "Failed to encode message");
                continue;
            }
        };
        if let Err(error) = sink.send(line).await {
            debug!(%error, "Write failed");
            return;
        }
    }
}
