use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct HubMetrics {
    published: Counter,
    delivered: Counter,
    dropped: Counter,
    connections: Gauge,
    subscriptions: Gauge,
}

impl HubMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "events_published",
            "Count of events published to the hub",
            metrics.published.clone(),
        );
        reg.register(
            "events_delivered",
            "Count of events enqueued for subscribers",
            metrics.delivered.clone(),
        );
        reg.register(
            "events_dropped",
            "Count of events dropped because a subscriber's queue was full",
            metrics.dropped.clone(),
        );
        reg.register(
            "connections",
            "Gauge of the number of subscriber connections",
            metrics.connections.clone(),
        );
        reg.register(
            "subscriptions",
            "Gauge of the number of subscriptions",
            metrics.subscriptions.clone(),
        );
        metrics
    }

    pub(crate) fn published(&self) {
        self.published.inc();
    }

    pub(crate) fn delivered(&self) {
        self.delivered.inc();
    }

    pub(crate) fn dropped(&self) {
        self.dropped.inc();
    }

    pub(crate) fn connected(&self) {
        self.connections.inc();
    }

    pub(crate) fn disconnected(&self) {
        self.connections.dec();
    }

    pub(crate) fn subscribed(&self) {
        self.subscriptions.inc();
    }

    pub(crate) fn unsubscribed(&self, n: usize) {
        self.subscriptions.dec_by(n as i64);
    }
}
