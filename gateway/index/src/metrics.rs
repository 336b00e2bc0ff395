use fleet_gateway_core::{ClusterId, ConnectionMode, Error};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct DispatchMetrics {
    dispatches: Family<DispatchLabels, Counter>,
}

#[derive(Clone, Debug, Default)]
pub struct WatchMetrics {
    restarts: Family<ClusterLabels, Counter>,
    events: Family<ClusterLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DispatchLabels {
    mode: &'static str,
    outcome: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ClusterLabels {
    cluster: String,
}

// === impl DispatchMetrics ===

impl DispatchMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "dispatches",
            "Count of proxied operations, by connection mode and outcome",
            metrics.dispatches.clone(),
        );
        metrics
    }

    pub(crate) fn dispatched<T>(&self, mode: ConnectionMode, res: &Result<T, Error>) {
        self.record(mode.as_str(), res.as_ref().err());
    }

    /// Records an operation that failed before reaching a cluster.
    pub(crate) fn rejected(&self, error: &Error) {
        self.record("none", Some(error));
    }

    fn record(&self, mode: &'static str, error: Option<&Error>) {
        let outcome = match error {
            None => "ok",
            Some(Error::Upstream { .. }) => "upstream",
            Some(Error::Timeout(_)) => "timeout",
            Some(Error::Transport(_)) => "transport",
            Some(Error::Validation { .. }) => "invalid",
            Some(_) => "unavailable",
        };
        self.dispatches
            .get_or_create(&DispatchLabels { mode, outcome })
            .inc();
    }
}

// === impl WatchMetrics ===

impl WatchMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "restarts",
            "Count of watch restarts after errors, by cluster",
            metrics.restarts.clone(),
        );
        reg.register(
            "events",
            "Count of events observed by watches, by cluster",
            metrics.events.clone(),
        );
        metrics
    }

    pub(crate) fn restarted(&self, cluster: &ClusterId) {
        self.restarts
            .get_or_create(&ClusterLabels {
                cluster: cluster.to_string(),
            })
            .inc();
    }

    pub(crate) fn observed(&self, cluster: &ClusterId) {
        self.events
            .get_or_create(&ClusterLabels {
                cluster: cluster.to_string(),
            })
            .inc();
    }
}
