//! Frames exchanged between the gateway and cluster agents.
//!
//! Every frame is a protobuf message prefixed by its length. After an agent
//! dials in, the first frame it writes must be a [`Hello`]; from then on either
//! side may write any frame at any time. Responses are matched to requests by
//! correlation ID, not by order.

use bytes::Bytes;
use fleet_gateway_core::{ApiRequest, ApiResponse, Error, Result};
use http::{Method, StatusCode};
use std::collections::HashMap;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Frame {
    #[prost(oneof = "frame::Kind", tags = "1, 2, 3, 4, 5")]
    pub kind: Option<frame::Kind>,
}

pub mod frame {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Hello(super::Hello),
        #[prost(message, tag = "2")]
        Request(super::Request),
        #[prost(message, tag = "3")]
        Response(super::Response),
        #[prost(message, tag = "4")]
        Heartbeat(super::Heartbeat),
        #[prost(message, tag = "5")]
        Cancel(super::Cancel),
    }
}

/// Identifies the cluster an agent serves.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Hello {
    #[prost(string, tag = "1")]
    pub cluster_id: String,
    #[prost(string, tag = "2")]
    pub agent_version: String,
}

/// An API request the agent should execute against its local API server.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    #[prost(uint64, tag = "1")]
    pub correlation_id: u64,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(string, tag = "3")]
    pub path: String,
    #[prost(map = "string, string", tag = "4")]
    pub headers: HashMap<String, String>,
    #[prost(bytes = "bytes", tag = "5")]
    pub body: Bytes,
    /// When set, the response body is streamed as a sequence of frames.
    #[prost(bool, tag = "6")]
    pub watch: bool,
}

/// The agent's answer to a request.
///
/// Unary requests are answered by exactly one response. Watches are answered
/// by zero or more chunks with `stream_end` unset followed by one with
/// `stream_end` set. A status code of zero means "not reported".
#[derive(Clone, PartialEq, prost::Message)]
pub struct Response {
    #[prost(uint64, tag = "1")]
    pub correlation_id: u64,
    #[prost(uint32, tag = "2")]
    pub status_code: u32,
    #[prost(bytes = "bytes", tag = "3")]
    pub body: Bytes,
    #[prost(string, optional, tag = "4")]
    pub error: Option<String>,
    #[prost(bool, tag = "5")]
    pub stream_end: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Heartbeat {}

/// Asks the agent to abandon an in-flight request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Cancel {
    #[prost(uint64, tag = "1")]
    pub correlation_id: u64,
}

// === impl Frame ===

impl Frame {
    pub fn hello(cluster_id: impl Into<String>, agent_version: impl Into<String>) -> Self {
        Self::from(frame::Kind::Hello(Hello {
            cluster_id: cluster_id.into(),
            agent_version: agent_version.into(),
        }))
    }

    pub fn heartbeat() -> Self {
        Self::from(frame::Kind::Heartbeat(Heartbeat {}))
    }

    pub fn cancel(correlation_id: u64) -> Self {
        Self::from(frame::Kind::Cancel(Cancel { correlation_id }))
    }

    pub fn request(correlation_id: u64, req: ApiRequest, watch: bool) -> Self {
        Self::from(frame::Kind::Request(Request {
            correlation_id,
            method: req.method.to_string(),
            path: req.path,
            headers: req.headers.into_iter().collect(),
            body: req.body,
            watch,
        }))
    }

    pub fn response(rsp: Response) -> Self {
        Self::from(frame::Kind::Response(rsp))
    }
}

impl From<frame::Kind> for Frame {
    fn from(kind: frame::Kind) -> Self {
        Self { kind: Some(kind) }
    }
}

// === impl Request ===

impl Request {
    /// Rebuilds the API request an agent should execute.
    pub fn to_api_request(&self) -> Result<ApiRequest> {
        let method = Method::from_bytes(self.method.as_bytes()).map_err(|_| Error::Validation {
            field: "method",
            reason: format!("{:?}", self.method),
        })?;
        let mut req = ApiRequest::new(method, self.path.clone());
        req.headers = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        req.body = self.body.clone();
        Ok(req)
    }
}

// === impl Response ===

impl Response {
    /// Answers a unary request with the upstream's status and body.
    pub fn unary(correlation_id: u64, status: StatusCode, body: Bytes) -> Self {
        Self {
            correlation_id,
            status_code: status.as_u16().into(),
            body,
            error: None,
            stream_end: true,
        }
    }

    /// Reports that a request could not be executed at all.
    pub fn failed(correlation_id: u64, error: impl ToString) -> Self {
        Self {
            correlation_id,
            status_code: 0,
            body: Bytes::new(),
            error: Some(error.to_string()),
            stream_end: true,
        }
    }

    /// Carries part of a watch's response body.
    pub fn chunk(correlation_id: u64, body: Bytes) -> Self {
        Self {
            correlation_id,
            status_code: 0,
            body,
            error: None,
            stream_end: false,
        }
    }

    /// Ends a watch.
    pub fn end(correlation_id: u64) -> Self {
        Self {
            correlation_id,
            status_code: 0,
            body: Bytes::new(),
            error: None,
            stream_end: true,
        }
    }

    /// The status the upstream reported, if any.
    pub fn status(&self) -> Result<Option<StatusCode>> {
        if self.status_code == 0 {
            return Ok(None);
        }
        u16::try_from(self.status_code)
            .ok()
            .and_then(|code| StatusCode::from_u16(code).ok())
            .map(Some)
            .ok_or_else(|| Error::Transport(format!("invalid status code {}", self.status_code)))
    }

    /// Converts a unary answer into the result a caller sees. Agent-side
    /// failures surface as upstream errors, as a bad gateway unless the agent
    /// reported a status.
    pub fn into_result(self) -> Result<ApiResponse> {
        let status = self.status()?;
        if let Some(error) = self.error {
            return Err(Error::Upstream {
                status: status.unwrap_or(StatusCode::BAD_GATEWAY),
                body: Bytes::from(error),
            });
        }
        let status = status.ok_or_else(|| Error::Transport("response carried no status".into()))?;
        ApiResponse::from_upstream(status, self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_errors_are_bad_gateway() {
        match Response::failed(1, "connection refused").into_result() {
            Err(Error::Upstream { status, body }) => {
                assert_eq!(status, StatusCode::BAD_GATEWAY);
                assert_eq!(body, "connection refused");
            }
            res => panic!("unexpected result: {res:?}"),
        }
    }

    #[test]
    fn upstream_statuses_pass_through() {
        let rsp = Response::unary(1, StatusCode::NOT_FOUND, Bytes::from_static(b"{}"));
        assert!(matches!(
            rsp.into_result(),
            Err(Error::Upstream { status: StatusCode::NOT_FOUND, .. })
        ));

        let rsp = Response::unary(2, StatusCode::OK, Bytes::from_static(b"{}"));
        assert_eq!(rsp.into_result().unwrap().status, StatusCode::OK);
    }

    #[test]
    fn requests_survive_the_wire() {
        let req = ApiRequest::new(Method::PATCH, "/api/v1/namespaces/default/pods/web-0")
            .body(&b"{\"metadata\":{}}"[..]);
        let frame = Frame::request(7, req.clone(), false);
        let Some(frame::Kind::Request(wire)) = frame.kind else {
            panic!("expected a request frame");
        };
        assert_eq!(wire.correlation_id, 7);
        assert_eq!(wire.to_api_request().unwrap(), req);
    }
}
