use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct TunnelMetrics {
    sessions: Gauge,
    sessions_opened: Counter,
    sessions_closed: Family<CloseLabels, Counter>,
    requests: Family<RequestLabels, Counter>,
    late_responses: Counter,
    pending: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CloseLabels {
    reason: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    kind: &'static str,
    outcome: &'static str,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Ok,
    Upstream,
    Timeout,
    Transport,
}

// === impl TunnelMetrics ===

impl TunnelMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "sessions",
            "Gauge of the number of open agent sessions",
            metrics.sessions.clone(),
        );
        reg.register(
            "sessions_opened",
            "Count of agent sessions opened",
            metrics.sessions_opened.clone(),
        );
        reg.register(
            "sessions_closed",
            "Count of agent sessions closed, by reason",
            metrics.sessions_closed.clone(),
        );
        reg.register(
            "requests",
            "Count of requests sent over agent sessions, by outcome",
            metrics.requests.clone(),
        );
        reg.register(
            "late_responses",
            "Count of responses discarded because no request was waiting for them",
            metrics.late_responses.clone(),
        );
        reg.register(
            "pending_requests",
            "Gauge of the number of requests awaiting a response from an agent",
            metrics.pending.clone(),
        );
        metrics
    }

    pub(crate) fn session_opened(&self) {
        self.sessions.inc();
        self.sessions_opened.inc();
    }

    pub(crate) fn session_closed(&self, reason: &'static str) {
        self.sessions.dec();
        self.sessions_closed
            .get_or_create(&CloseLabels { reason })
            .inc();
    }

    pub(crate) fn request(&self, kind: &'static str, outcome: Outcome) {
        let outcome = match outcome {
            Outcome::Ok => "ok",
            Outcome::Upstream => "upstream",
            Outcome::Timeout => "timeout",
            Outcome::Transport => "transport",
        };
        self.requests
            .get_or_create(&RequestLabels { kind, outcome })
            .inc();
    }

    pub(crate) fn late_response(&self) {
        self.late_responses.inc();
    }

    pub(crate) fn pending_added(&self) {
        self.pending.inc();
    }

    pub(crate) fn pending_removed(&self, n: usize) {
        self.pending.dec_by(n as i64);
    }
}

// === impl Outcome ===

impl Outcome {
    pub(crate) fn of<T>(res: &fleet_gateway_core::Result<T>) -> Self {
        use fleet_gateway_core::Error;
        match res {
            Ok(_) => Self::Ok,
            Err(Error::Upstream { .. }) => Self::Upstream,
            Err(Error::Timeout(_)) => Self::Timeout,
            Err(_) => Self::Transport,
        }
    }
}
