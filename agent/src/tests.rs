use super::*;
use fleet_gateway_core::{ApiRequest, RawWatchEvent, ResourceType};
use fleet_gateway_tunnel::{AgentSession, SessionConfig, TunnelMetrics};
use http::StatusCode;
use kube::client::Body;
use std::convert::Infallible;
use tokio::io::DuplexStream;

type GatewayEnd = Framed<DuplexStream, FrameCodec>;

/// Starts an agent whose API server answers every request with `status` and
/// `body`, and returns the gateway's end of its tunnel.
fn agent(status: StatusCode, body: &'static str, heartbeat: Duration) -> GatewayEnd {
    let svc = tower::service_fn(move |_: http::Request<Body>| async move {
        let rsp = http::Response::builder()
            .status(status)
            .body(Body::from(body.as_bytes().to_vec()))
            .unwrap();
        Ok::<_, Infallible>(rsp)
    });
    let client = DirectClient::new(ClusterId::from("c1"), kube::Client::new(svc, "default"));
    let agent = Agent::new(client, heartbeat);

    let (gateway, io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move { agent.serve(io).await });
    Framed::new(gateway, FrameCodec::default())
}

/// Reads the agent's hello and starts the gateway's session over the tunnel.
async fn accept(mut gateway: GatewayEnd) -> AgentSession {
    let hello = match gateway.next().await.unwrap().unwrap().kind {
        Some(frame::Kind::Hello(hello)) => hello,
        kind => panic!("expected a hello, got {kind:?}"),
    };
    assert_eq!(hello.cluster_id, "c1");
    assert_eq!(hello.agent_version, env!("CARGO_PKG_VERSION"));
    AgentSession::start(
        gateway,
        ClusterId::from(hello.cluster_id),
        hello.agent_version,
        SessionConfig {
            heartbeat_timeout: None,
            ..Default::default()
        },
        TunnelMetrics::default(),
    )
}

#[tokio::test]
async fn serves_unary_requests() {
    const PODS: &str = r#"{"kind":"PodList","items":[]}"#;
    let session = accept(agent(StatusCode::OK, PODS, Duration::from_secs(10))).await;

    let rsp = session
        .send(ApiRequest::get("/api/v1/namespaces/default/pods"))
        .await
        .expect("request must succeed");
    assert_eq!(rsp.status, StatusCode::OK);
    assert_eq!(rsp.body, PODS);
}

#[tokio::test]
async fn relays_upstream_statuses() {
    let session = accept(agent(
        StatusCode::NOT_FOUND,
        r#"{"kind":"Status","code":404,"message":"pods \"web\" not found"}"#,
        Duration::from_secs(10),
    ))
    .await;

    match session
        .send(ApiRequest::get("/api/v1/namespaces/default/pods/web"))
        .await
    {
        Err(Error::Upstream { status, .. }) => assert_eq!(status, StatusCode::NOT_FOUND),
        res => panic!("unexpected result: {res:?}"),
    }
}

#[tokio::test]
async fn relays_watches() {
    const EVENTS: &str = concat!(
        r#"{"type":"ADDED","object":{"apiVersion":"v1","kind":"Pod","metadata":{"name":"a","resourceVersion":"1"}}}"#,
        "\n",
        r#"{"type":"DELETED","object":{"apiVersion":"v1","kind":"Pod","metadata":{"name":"a","resourceVersion":"2"}}}"#,
        "\n",
    );
    let session = accept(agent(StatusCode::OK, EVENTS, Duration::from_secs(10))).await;

    let pods = "_/v1/pods".parse::<ResourceType>().unwrap();
    let events = session
        .watch(pods.watch_request(None, None))
        .await
        .expect("watch must open")
        .try_collect::<Vec<_>>()
        .await
        .expect("watch must end cleanly");
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], RawWatchEvent::Added(pod) if pod.metadata.name.as_deref() == Some("a")));
    assert!(matches!(&events[1], RawWatchEvent::Deleted(_)));
    assert_eq!(session.pending_len(), 0);
}

#[tokio::test]
async fn sends_heartbeats() {
    let mut gateway = agent(StatusCode::OK, "{}", Duration::from_millis(10));
    assert!(matches!(
        gateway.next().await.unwrap().unwrap().kind,
        Some(frame::Kind::Hello(_))
    ));
    for _ in 0..2 {
        let frame = time::timeout(Duration::from_secs(5), gateway.next())
            .await
            .expect("agent must heartbeat")
            .unwrap()
            .unwrap();
        assert!(matches!(frame.kind, Some(frame::Kind::Heartbeat(_))));
        gateway.send(Frame::heartbeat()).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn gives_up_on_a_silent_gateway() {
    let svc = tower::service_fn(|_: http::Request<Body>| async move {
        Ok::<_, Infallible>(http::Response::new(Body::from(Vec::new())))
    });
    let client = DirectClient::new(ClusterId::from("c1"), kube::Client::new(svc, "default"));
    let agent = Agent::new(client, Duration::from_secs(1));
    let (_gateway, io) = tokio::io::duplex(64 * 1024);

    let err = agent
        .serve(io)
        .await
        .expect_err("a silent gateway must fail the tunnel");
    assert!(err.to_string().contains("silent"), "{err}");
}
