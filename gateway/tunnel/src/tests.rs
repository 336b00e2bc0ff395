use super::*;
use crate::proto::{self, frame, Frame, Response};
use bytes::Bytes;
use fleet_gateway_core::{ApiRequest, Backend, ClusterId, Error, RawWatchEvent, ResourceType};
use futures::prelude::*;
use http::StatusCode;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{io::DuplexStream, time};
use tokio_util::codec::Framed;

type AgentEnd = Framed<DuplexStream, FrameCodec>;

fn config() -> SessionConfig {
    SessionConfig {
        request_timeout: Duration::from_secs(5),
        heartbeat_timeout: None,
        ..Default::default()
    }
}

fn start(config: SessionConfig) -> (AgentSession, AgentEnd) {
    let (gateway, agent) = tokio::io::duplex(64 * 1024);
    let session = AgentSession::start(
        Framed::new(gateway, FrameCodec::default()),
        ClusterId::from("c1"),
        "test".to_string(),
        config,
        TunnelMetrics::default(),
    );
    (session, Framed::new(agent, FrameCodec::default()))
}

/// Reads frames until the gateway sends something other than a heartbeat.
async fn next_frame(agent: &mut AgentEnd) -> frame::Kind {
    loop {
        let frame = agent
            .next()
            .await
            .expect("gateway must not close the tunnel")
            .expect("frame must decode");
        match frame.kind {
            Some(frame::Kind::Heartbeat(_)) => continue,
            Some(kind) => return kind,
            None => panic!("empty frame"),
        }
    }
}

async fn next_request(agent: &mut AgentEnd) -> proto::Request {
    match next_frame(agent).await {
        frame::Kind::Request(req) => req,
        kind => panic!("expected a request, got {kind:?}"),
    }
}

async fn respond(agent: &mut AgentEnd, rsp: Response) {
    agent.send(Frame::response(rsp)).await.unwrap();
}

fn ok(id: u64, body: &'static str) -> Response {
    Response::unary(id, StatusCode::OK, Bytes::from_static(body.as_bytes()))
}

#[tokio::test]
async fn responses_are_matched_by_correlation_id() {
    let (session, mut agent) = start(config());

    let first = tokio::spawn({
        let session = session.clone();
        async move { session.send(ApiRequest::get("/api/v1/namespaces")).await }
    });
    let a = next_request(&mut agent).await;
    let second = tokio::spawn({
        let session = session.clone();
        async move { session.send(ApiRequest::get("/api/v1/nodes")).await }
    });
    let b = next_request(&mut agent).await;
    assert_ne!(a.correlation_id, b.correlation_id);
    assert_eq!(a.path, "/api/v1/namespaces");
    assert_eq!(b.path, "/api/v1/nodes");

    respond(&mut agent, ok(b.correlation_id, "nodes")).await;
    respond(&mut agent, ok(a.correlation_id, "namespaces")).await;

    assert_eq!(first.await.unwrap().unwrap().body, "namespaces");
    assert_eq!(second.await.unwrap().unwrap().body, "nodes");
    assert_eq!(session.pending_len(), 0);
}

#[tokio::test]
async fn upstream_statuses_are_surfaced() {
    let (session, mut agent) = start(config());

    let call = tokio::spawn({
        let session = session.clone();
        async move { session.send(ApiRequest::get("/api/v1/namespaces/nope")).await }
    });
    let req = next_request(&mut agent).await;
    respond(
        &mut agent,
        Response::unary(req.correlation_id, StatusCode::NOT_FOUND, Bytes::new()),
    )
    .await;

    assert!(matches!(
        call.await.unwrap(),
        Err(Error::Upstream {
            status: StatusCode::NOT_FOUND,
            ..
        })
    ));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn late_responses_are_discarded() {
    let (session, mut agent) = start(config());

    let call = tokio::spawn({
        let session = session.clone();
        async move { session.send(ApiRequest::get("/api/v1/pods")).await }
    });
    let req = next_request(&mut agent).await;

    // The agent never answers in time.
    match call.await.unwrap() {
        Err(Error::Timeout(timeout)) => assert_eq!(timeout, Duration::from_secs(5)),
        res => panic!("expected a timeout, got {res:?}"),
    }
    assert_eq!(session.pending_len(), 0);
    match next_frame(&mut agent).await {
        frame::Kind::Cancel(cancel) => assert_eq!(cancel.correlation_id, req.correlation_id),
        kind => panic!("expected a cancellation, got {kind:?}"),
    }

    // The late response must not be delivered to the next caller.
    respond(&mut agent, ok(req.correlation_id, "late")).await;
    let call = tokio::spawn({
        let session = session.clone();
        async move { session.send(ApiRequest::get("/api/v1/pods")).await }
    });
    let next = next_request(&mut agent).await;
    assert_ne!(next.correlation_id, req.correlation_id);
    respond(&mut agent, ok(next.correlation_id, "fresh")).await;
    assert_eq!(call.await.unwrap().unwrap().body, "fresh");
}

#[tokio::test]
async fn closing_fails_every_pending_request() {
    let (session, mut agent) = start(config());

    let mut calls = Vec::new();
    for _ in 0..3 {
        let session = session.clone();
        calls.push(tokio::spawn(async move {
            session.send(ApiRequest::get("/api/v1/pods")).await
        }));
        next_request(&mut agent).await;
    }
    assert_eq!(session.pending_len(), 3);

    drop(agent);
    for call in calls {
        assert!(matches!(call.await.unwrap(), Err(Error::Transport(_))));
    }
    assert_eq!(session.closed().await, CloseReason::Eof);
    assert_eq!(session.pending_len(), 0);

    // New requests fail immediately.
    assert!(matches!(
        session.send(ApiRequest::get("/api/v1/pods")).await,
        Err(Error::Transport(_))
    ));
}

#[tokio::test]
async fn abandoned_requests_are_cancelled() {
    let (session, mut agent) = start(config());

    let call = tokio::spawn({
        let session = session.clone();
        async move { session.send(ApiRequest::get("/api/v1/pods")).await }
    });
    let req = next_request(&mut agent).await;
    call.abort();
    assert!(call.await.unwrap_err().is_cancelled());

    match next_frame(&mut agent).await {
        frame::Kind::Cancel(cancel) => assert_eq!(cancel.correlation_id, req.correlation_id),
        kind => panic!("expected a cancellation, got {kind:?}"),
    }
    assert_eq!(session.pending_len(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn silent_agents_are_evicted() {
    let (session, mut agent) = start(SessionConfig {
        heartbeat_timeout: Some(Duration::from_secs(5)),
        ..config()
    });

    time::sleep(Duration::from_secs(3)).await;
    agent.send(Frame::heartbeat()).await.unwrap();
    time::sleep(Duration::from_secs(4)).await;
    assert!(!session.is_closed(), "heartbeat must refresh liveness");

    assert_eq!(session.closed().await, CloseReason::HeartbeatTimeout);
}

#[tokio::test]
async fn watches_stream_until_the_agent_ends_them() {
    let (session, mut agent) = start(config());
    let pods = "v1/pods".parse::<ResourceType>().unwrap();

    let watch = tokio::spawn({
        let session = session.clone();
        let req = pods.watch_request(None, None);
        async move {
            session
                .watch(req)
                .await?
                .try_collect::<Vec<_>>()
                .await
        }
    });
    let req = next_request(&mut agent).await;
    assert!(req.watch);

    let body = concat!(
        r#"{"type":"ADDED","object":{"apiVersion":"v1","kind":"Pod","metadata":{"name":"a","namespace":"default"}}}"#,
        "\n",
        r#"{"type":"MODIFIED","object":{"apiVersion":"v1","kind":"Pod","metadata":{"name":"a","namespace":"default"}}}"#,
        "\n",
    );
    // Split an event across chunks.
    let (head, tail) = body.split_at(40);
    let id = req.correlation_id;
    respond(&mut agent, Response::chunk(id, Bytes::from_static(head.as_bytes()))).await;
    respond(&mut agent, Response::chunk(id, Bytes::from_static(tail.as_bytes()))).await;
    respond(&mut agent, Response::end(id)).await;

    let events = watch.await.unwrap().unwrap();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], RawWatchEvent::Added(_)));
    assert!(matches!(events[1], RawWatchEvent::Modified(_)));
    assert_eq!(session.pending_len(), 0);
}

#[tokio::test]
async fn watch_failures_surface_upstream_status() {
    let (session, mut agent) = start(config());
    let pods = "v1/pods".parse::<ResourceType>().unwrap();

    let watch = tokio::spawn({
        let session = session.clone();
        let req = pods.watch_request(None, Some("1"));
        async move {
            session
                .watch(req)
                .await?
                .try_collect::<Vec<_>>()
                .await
        }
    });
    let req = next_request(&mut agent).await;
    respond(
        &mut agent,
        Response::unary(req.correlation_id, StatusCode::GONE, Bytes::new()),
    )
    .await;

    assert!(matches!(
        watch.await.unwrap(),
        Err(Error::Upstream {
            status: StatusCode::GONE,
            ..
        })
    ));
}

#[tokio::test]
async fn closing_fails_watches_with_full_buffers() {
    let (session, mut agent) = start(SessionConfig {
        watch_buffer: 1,
        ..config()
    });
    let pods = "v1/pods".parse::<ResourceType>().unwrap();
    let chunks = session
        .send_watch(pods.watch_request(None, None))
        .await
        .expect("watch must open");
    let req = next_request(&mut agent).await;
    respond(&mut agent, Response::chunk(req.correlation_id, Bytes::from_static(b"{}\n"))).await;
    drop(agent);
    assert_eq!(session.closed().await, CloseReason::Eof);

    let items = chunks.collect::<Vec<_>>().await;
    assert_eq!(items.len(), 2, "{items:?}");
    assert_eq!(items[0].as_ref().unwrap(), &Bytes::from_static(b"{}\n"));
    assert!(matches!(items[1], Err(Error::Transport(_))), "{items:?}");
    assert_eq!(session.pending_len(), 0);
}

#[tokio::test]
async fn lagging_watches_end_with_an_error() {
    let (session, mut agent) = start(SessionConfig {
        watch_buffer: 1,
        ..config()
    });
    let pods = "v1/pods".parse::<ResourceType>().unwrap();
    let chunks = session
        .send_watch(pods.watch_request(None, None))
        .await
        .expect("watch must open");
    let req = next_request(&mut agent).await;
    let id = req.correlation_id;
    respond(&mut agent, Response::chunk(id, Bytes::from_static(b"a\n"))).await;
    respond(&mut agent, Response::chunk(id, Bytes::from_static(b"b\n"))).await;

    match next_frame(&mut agent).await {
        frame::Kind::Cancel(proto::Cancel { correlation_id }) => assert_eq!(correlation_id, id),
        kind => panic!("expected a cancellation, got {kind:?}"),
    }
    assert_eq!(session.pending_len(), 0);

    let items = chunks.collect::<Vec<_>>().await;
    assert_eq!(items.len(), 2, "{items:?}");
    assert_eq!(items[0].as_ref().unwrap(), &Bytes::from_static(b"a\n"));
    assert!(matches!(items[1], Err(Error::Transport(_))), "{items:?}");
    assert!(!session.is_closed());
}

#[derive(Default)]
struct Clusters {
    known: Vec<&'static str>,
    attached: Mutex<Vec<u64>>,
    detached: Mutex<Vec<u64>>,
}

impl AttachAgent for Clusters {
    fn attach(&self, session: AgentSession) -> fleet_gateway_core::Result<()> {
        if !self.known.contains(&session.cluster().as_str()) {
            return Err(Error::ClusterNotFound(session.cluster().clone()));
        }
        self.attached.lock().push(session.id());
        Ok(())
    }

    fn detach(&self, session: &AgentSession) {
        self.detached.lock().push(session.id());
    }
}

#[tokio::test]
async fn acceptor_binds_known_clusters() {
    let clusters = Arc::new(Clusters {
        known: vec!["c1"],
        ..Default::default()
    });
    let acceptor = Acceptor::new(
        clusters.clone(),
        config(),
        Duration::from_secs(1),
        TunnelMetrics::default(),
    );

    let (gateway, agent) = tokio::io::duplex(64 * 1024);
    let mut agent = Framed::new(agent, FrameCodec::default());
    agent.send(Frame::hello("c1", "v1.0.0")).await.unwrap();
    let session = acceptor.accept(gateway).await.unwrap();
    assert_eq!(session.cluster().as_str(), "c1");
    assert_eq!(session.agent_version(), "v1.0.0");
    assert_eq!(*clusters.attached.lock(), vec![session.id()]);

    drop(agent);
    session.closed().await;
    // Detaching happens on a background task.
    for _ in 0..100 {
        if !clusters.detached.lock().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(*clusters.detached.lock(), vec![session.id()]);
}

#[tokio::test]
async fn acceptor_refuses_unknown_clusters() {
    let clusters = Arc::new(Clusters {
        known: vec!["c1"],
        ..Default::default()
    });
    let acceptor = Acceptor::new(
        clusters.clone(),
        config(),
        Duration::from_secs(1),
        TunnelMetrics::default(),
    );

    let (gateway, agent) = tokio::io::duplex(64 * 1024);
    let mut agent = Framed::new(agent, FrameCodec::default());
    agent.send(Frame::hello("c9", "v1.0.0")).await.unwrap();
    assert!(matches!(
        acceptor.accept(gateway).await,
        Err(Error::ClusterNotFound(_))
    ));
    assert!(clusters.attached.lock().is_empty());

    // The agent observes the tunnel closing.
    while let Some(frame) = agent.next().await {
        assert!(frame.is_ok());
    }
}

#[tokio::test]
async fn acceptor_requires_a_hello() {
    let acceptor = Acceptor::new(
        Arc::new(Clusters::default()),
        config(),
        Duration::from_secs(1),
        TunnelMetrics::default(),
    );

    let (gateway, agent) = tokio::io::duplex(64 * 1024);
    let mut agent = Framed::new(agent, FrameCodec::default());
    agent.send(Frame::heartbeat()).await.unwrap();
    assert!(matches!(
        acceptor.accept(gateway).await,
        Err(Error::Transport(_))
    ));
}
