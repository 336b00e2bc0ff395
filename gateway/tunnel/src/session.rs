use crate::{
    codec::FrameCodec,
    metrics::{Outcome, TunnelMetrics},
    proto::{frame, Frame, Response},
};
use ahash::AHashMap;
use bytes::{Buf, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use fleet_gateway_core::{
    ApiRequest, ApiResponse, Backend, ClusterId, Error, RawWatchEvent, Result, WatchStream,
};
use futures::prelude::*;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot, watch},
    time::{self, Instant},
};
use tokio_util::codec::Framed;
use tracing::{debug, info, info_span, trace, warn, Instrument};

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Bounds how long a request may wait for its response.
    pub request_timeout: Duration,

    /// Closes the session if the agent is silent for this long. When unset, only
    /// a transport failure ends a session.
    pub heartbeat_timeout: Option<Duration>,

    /// The number of frames that may be queued for the agent.
    pub outbound_capacity: usize,

    /// The number of unread watch chunks buffered before a watch is abandoned.
    pub watch_buffer: usize,
}

/// Why a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The agent closed the connection.
    Eof,
    Transport(String),
    HeartbeatTimeout,
    /// A newer session for the same cluster took over.
    Replaced,
    /// The cluster was unregistered.
    Removed,
    /// The agent named a cluster that may not connect.
    Refused,
    Shutdown,
}

/// The gateway's end of an agent's tunnel.
///
/// Requests are multiplexed over the tunnel by correlation ID. Each request is
/// resolved exactly once: by its response, by its timeout, or by the session
/// closing.
#[derive(Clone)]
pub struct AgentSession {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    cluster: ClusterId,
    agent_version: String,
    next_correlation: AtomicU64,
    pending: Mutex<Pending>,
    outbound: mpsc::Sender<Frame>,
    liveness: Mutex<Liveness>,
    closed: watch::Sender<Option<CloseReason>>,
    config: SessionConfig,
    metrics: TunnelMetrics,
}

#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: AHashMap<u64, Waiter>,
}

enum Waiter {
    Unary(oneshot::Sender<Result<ApiResponse>>),
    /// A watch's chunks, and how it ended. The outcome is read only after the
    /// last chunk, so a full chunk buffer cannot swallow a failure.
    Watch {
        chunks: mpsc::Sender<Bytes>,
        end: oneshot::Sender<Result<()>>,
    },
}

struct Liveness {
    last_frame: Instant,
    last_seen: DateTime<Utc>,
}

/// Withdraws a request from the pending table when its caller goes away, and
/// tells the agent to stop working on it.
struct Call {
    inner: Arc<Inner>,
    id: u64,
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// === impl SessionConfig ===

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            heartbeat_timeout: Some(Duration::from_secs(45)),
            outbound_capacity: 128,
            watch_buffer: 64,
        }
    }
}

// === impl CloseReason ===

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eof => "eof",
            Self::Transport(_) => "transport",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Replaced => "replaced",
            Self::Removed => "removed",
            Self::Refused => "refused",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            reason => f.write_str(reason.as_str()),
        }
    }
}

// === impl AgentSession ===

impl AgentSession {
    /// Starts serving a tunnel whose hello has already been read.
    ///
    /// Spawns the session's reader, writer, and liveness tasks, which run until
    /// the session closes.
    pub fn start<T>(
        framed: Framed<T, FrameCodec>,
        cluster: ClusterId,
        agent_version: String,
        config: SessionConfig,
        metrics: TunnelMetrics,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound, rx) = mpsc::channel(config.outbound_capacity.max(1));
        let inner = Arc::new(Inner {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            cluster,
            agent_version,
            next_correlation: AtomicU64::new(1),
            pending: Mutex::new(Pending::default()),
            outbound,
            liveness: Mutex::new(Liveness {
                last_frame: Instant::now(),
                last_seen: Utc::now(),
            }),
            closed: watch::channel(None).0,
            config,
            metrics,
        });
        inner.metrics.session_opened();

        let span = info_span!("session", cluster = %inner.cluster, id = inner.id);
        let (sink, stream) = framed.split();
        tokio::spawn(write_frames(inner.clone(), sink, rx).instrument(span.clone()));
        tokio::spawn(read_frames(inner.clone(), stream).instrument(span.clone()));
        if let Some(timeout) = inner.config.heartbeat_timeout {
            tokio::spawn(expire_silent(inner.clone(), timeout).instrument(span));
        }

        Self { inner }
    }

    /// Uniquely identifies this session among all sessions the process has
    /// accepted.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn cluster(&self) -> &ClusterId {
        &self.inner.cluster
    }

    pub fn agent_version(&self) -> &str {
        &self.inner.agent_version
    }

    /// The time the agent last wrote a frame.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.inner.liveness.lock().last_seen
    }

    /// The number of requests awaiting a response.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().waiters.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.borrow().is_some()
    }

    /// Closes the session, failing every pending request. Returns false if the
    /// session was already closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.inner.close(reason)
    }

    /// Completes when the session has closed.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.inner.closed.subscribe();
        closed_signal(&mut rx).await;
        let reason = rx.borrow().clone();
        reason.unwrap_or(CloseReason::Shutdown)
    }

    /// Sends a request to the agent and waits for its response.
    pub async fn send(&self, req: ApiRequest) -> Result<ApiResponse> {
        let timeout = self.inner.config.request_timeout;
        let deadline = Instant::now() + timeout;
        let (tx, mut rx) = oneshot::channel();
        let call = self.inner.register(Waiter::Unary(tx))?;
        trace!(id = call.id, method = %req.method, path = %req.path, "Sending request");
        let frame = Frame::request(call.id, req, false);

        let res = time::timeout_at(deadline, async {
            self.inner
                .outbound
                .send(frame)
                .await
                .map_err(|_| self.inner.closed_error())?;
            (&mut rx)
                .await
                .unwrap_or_else(|_| Err(self.inner.closed_error()))
        })
        .await;

        let res = match res {
            Ok(res) => res,
            Err(_) => {
                if self.inner.take(call.id).is_some() {
                    debug!(id = call.id, ?timeout, "Request timed out");
                    self.inner.cancel(call.id);
                    Err(Error::Timeout(timeout))
                } else {
                    // The response or the session's closure won the race, and
                    // has already been handed to the receiver.
                    rx.await
                        .unwrap_or_else(|_| Err(self.inner.closed_error()))
                }
            }
        };
        self.inner.metrics.request("unary", Outcome::of(&res));
        res
    }

    /// Opens a watch and returns the raw body chunks the agent relays.
    ///
    /// Dropping the stream cancels the watch. If the caller falls behind by more
    /// than the configured buffer, the watch is abandoned and the stream ends
    /// with an error.
    pub async fn send_watch(&self, req: ApiRequest) -> Result<impl Stream<Item = Result<Bytes>>> {
        let timeout = self.inner.config.request_timeout;
        let (chunks, mut rx) = mpsc::channel(self.inner.config.watch_buffer.max(1));
        let (end, ended) = oneshot::channel();
        let call = self.inner.register(Waiter::Watch { chunks, end })?;
        trace!(id = call.id, path = %req.path, "Opening watch");
        let frame = Frame::request(call.id, req, true);

        match time::timeout(timeout, self.inner.outbound.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                let error = self.inner.closed_error();
                self.inner.metrics.request("watch", Outcome::Transport);
                return Err(error);
            }
            Err(_) => {
                self.inner.metrics.request("watch", Outcome::Timeout);
                return Err(Error::Timeout(timeout));
            }
        }
        self.inner.metrics.request("watch", Outcome::Ok);

        Ok(async_stream::stream! {
            let _call = call;
            while let Some(chunk) = rx.recv().await {
                yield Ok(chunk);
            }
            if let Ok(Err(error)) = ended.await {
                yield Err(error);
            }
        })
    }
}

impl fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSession")
            .field("id", &self.inner.id)
            .field("cluster", &self.inner.cluster)
            .field("agent_version", &self.inner.agent_version)
            .finish()
    }
}

#[async_trait::async_trait]
impl Backend for AgentSession {
    async fn request(&self, req: ApiRequest) -> Result<ApiResponse> {
        self.send(req).await
    }

    async fn watch(&self, req: ApiRequest) -> Result<WatchStream> {
        let chunks = self.send_watch(req).await?;
        Ok(decode_lines(chunks).boxed())
    }
}

/// Splits a watch body into newline-delimited events, regardless of how the
/// body was chunked.
fn decode_lines(
    chunks: impl Stream<Item = Result<Bytes>> + Send + 'static,
) -> impl Stream<Item = Result<RawWatchEvent>> + Send + 'static {
    async_stream::try_stream! {
        let mut buf = BytesMut::new();
        futures::pin_mut!(chunks);
        while let Some(chunk) = chunks.next().await {
            buf.extend_from_slice(&chunk?);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line = buf.split_to(pos + 1);
                if let Some(event) = parse_line(&line[..pos])? {
                    yield event;
                }
            }
        }
        if buf.has_remaining() {
            if let Some(event) = parse_line(&buf[..])? {
                yield event;
            }
        }
    }
}

fn parse_line(line: &[u8]) -> Result<Option<RawWatchEvent>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(line)
        .map(Some)
        .map_err(|e| Error::Transport(format!("invalid watch event: {e}")))
}

// === impl Inner ===

impl Inner {
    fn register(self: &Arc<Self>, waiter: Waiter) -> Result<Call> {
        let mut pending = self.pending.lock();
        if pending.closed {
            return Err(self.closed_error());
        }
        let id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        pending.waiters.insert(id, waiter);
        self.metrics.pending_added();
        Ok(Call {
            inner: self.clone(),
            id,
        })
    }

    fn take(&self, id: u64) -> Option<Waiter> {
        let waiter = self.pending.lock().waiters.remove(&id);
        if waiter.is_some() {
            self.metrics.pending_removed(1);
        }
        waiter
    }

    fn cancel(&self, id: u64) {
        if self.outbound.try_send(Frame::cancel(id)).is_err() {
            debug!(id, "Could not send cancellation");
        }
    }

    fn closed_error(&self) -> Error {
        match &*self.closed.borrow() {
            Some(reason) => Error::Transport(format!("agent session closed: {reason}")),
            None => Error::Transport("agent session closed".into()),
        }
    }

    fn touch(&self) {
        let mut liveness = self.liveness.lock();
        liveness.last_frame = Instant::now();
        liveness.last_seen = Utc::now();
    }

    fn close(&self, reason: CloseReason) -> bool {
        let waiters = {
            let mut pending = self.pending.lock();
            if pending.closed {
                return false;
            }
            pending.closed = true;
            std::mem::take(&mut pending.waiters)
        };
        match &reason {
            CloseReason::Transport(_) | CloseReason::HeartbeatTimeout => {
                warn!(%reason, pending = waiters.len(), "Session closed")
            }
            _ => info!(%reason, pending = waiters.len(), "Session closed"),
        }
        self.metrics.session_closed(reason.as_str());
        self.metrics.pending_removed(waiters.len());
        self.closed.send_replace(Some(reason));

        for (_, waiter) in waiters {
            waiter.fail(self.closed_error());
        }
        true
    }

    fn handle_frame(&self, frame: Frame) {
        self.touch();
        match frame.kind {
            Some(frame::Kind::Response(rsp)) => self.handle_response(rsp),
            Some(frame::Kind::Heartbeat(_)) => {
                trace!("Heartbeat");
                let _ = self.outbound.try_send(Frame::heartbeat());
            }
            Some(frame::Kind::Hello(_) | frame::Kind::Request(_) | frame::Kind::Cancel(_)) => {
                debug!("Ignoring unexpected frame");
            }
            None => debug!("Ignoring empty frame"),
        }
    }

    fn handle_response(&self, rsp: Response) {
        let id = rsp.correlation_id;
        let mut pending = self.pending.lock();
        let chunks = match pending.waiters.get(&id) {
            None => {
                drop(pending);
                debug!(id, "Discarding response for unknown request");
                self.metrics.late_response();
                return;
            }
            Some(Waiter::Watch { chunks, .. }) if !rsp.stream_end => Some(chunks.clone()),
            Some(_) => None,
        };

        let Some(chunks) = chunks else {
            // The request is complete.
            let waiter = pending.waiters.remove(&id);
            drop(pending);
            self.metrics.pending_removed(1);
            match waiter {
                Some(Waiter::Unary(tx)) => {
                    let _ = tx.send(rsp.into_result());
                }
                Some(Waiter::Watch { end, .. }) => {
                    let _ = end.send(watch_result(rsp));
                }
                None => {}
            }
            return;
        };
        drop(pending);

        let chunk = match rsp.status() {
            Ok(Some(status)) if !status.is_success() => Err(Error::Upstream {
                status,
                body: rsp.body,
            }),
            Ok(_) => Ok(rsp.body),
            Err(error) => Err(error),
        };
        let error = match chunk {
            Ok(chunk) => match chunks.try_send(chunk) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(id, "Watch consumer is lagging; abandoning watch");
                    Some(Error::Transport("watch consumer fell behind".into()))
                }
                // The consumer is gone.
                Err(mpsc::error::TrySendError::Closed(_)) => None,
            },
            Err(error) => Some(error),
        };
        if let (Some(waiter), Some(error)) = (self.take(id), error) {
            waiter.fail(error);
        }
        self.cancel(id);
    }
}

/// Interprets the frame that ends a watch.
fn watch_result(rsp: Response) -> Result<()> {
    let status = rsp.status()?;
    if let Some(error) = rsp.error {
        return Err(Error::Upstream {
            status: status.unwrap_or(http::StatusCode::BAD_GATEWAY),
            body: Bytes::from(error),
        });
    }
    match status {
        Some(status) if !status.is_success() => Err(Error::Upstream {
            status,
            body: rsp.body,
        }),
        _ => Ok(()),
    }
}

// === impl Waiter ===

impl Waiter {
    fn fail(self, error: Error) {
        match self {
            Self::Unary(tx) => {
                let _ = tx.send(Err(error));
            }
            Self::Watch { end, .. } => {
                let _ = end.send(Err(error));
            }
        }
    }
}

// === impl Call ===

impl Drop for Call {
    fn drop(&mut self) {
        if self.inner.take(self.id).is_some() {
            trace!(id = self.id, "Request abandoned");
            self.inner.cancel(self.id);
        }
    }
}

// === tasks ===

async fn closed_signal(rx: &mut watch::Receiver<Option<CloseReason>>) {
    let _ = rx.wait_for(Option::is_some).await;
}

async fn read_frames<S>(inner: Arc<Inner>, mut frames: S)
where
    S: Stream<Item = std::io::Result<Frame>> + Unpin,
{
    let mut closed = inner.closed.subscribe();
    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(frame)) => inner.handle_frame(frame),
                Some(Err(error)) => {
                    inner.close(CloseReason::Transport(error.to_string()));
                    return;
                }
                None => {
                    inner.close(CloseReason::Eof);
                    return;
                }
            },
            _ = closed_signal(&mut closed) => return,
        }
    }
}

async fn write_frames<S>(inner: Arc<Inner>, mut sink: S, mut rx: mpsc::Receiver<Frame>)
where
    S: Sink<Frame, Error = std::io::Error> + Unpin,
{
    let mut closed = inner.closed.subscribe();
    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { return };
                if let Err(error) = sink.send(frame).await {
                    inner.close(CloseReason::Transport(error.to_string()));
                    return;
                }
            }
            _ = closed_signal(&mut closed) => {
                let _ = sink.close().await;
                return;
            }
        }
    }
}

async fn expire_silent(inner: Arc<Inner>, timeout: Duration) {
    let mut closed = inner.closed.subscribe();
    loop {
        let deadline = inner.liveness.lock().last_frame + timeout;
        tokio::select! {
            _ = time::sleep_until(deadline) => {
                if inner.liveness.lock().last_frame + timeout <= Instant::now() {
                    inner.close(CloseReason::HeartbeatTimeout);
                    return;
                }
            }
            _ = closed_signal(&mut closed) => return,
        }
    }
}
