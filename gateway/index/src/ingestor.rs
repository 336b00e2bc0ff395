use crate::{dispatcher::ProxyDispatcher, metrics::WatchMetrics};
use fleet_gateway_core::{
    Backoff, ClusterId, Error, RawWatchEvent, ResourceType, WatchEvent, WatchStream,
};
use fleet_gateway_hub::EventHub;
use futures::prelude::*;
use http::StatusCode;
use std::time::Duration;
use tokio::{sync::watch, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Clone, Debug)]
pub struct WatchConfig {
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

/// The lifecycle of a single watch loop.
///
/// `Stopped` is terminal and is reached only when the loop is stopped or its
/// cluster is removed or disconnected, never because of a transient error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WatchState {
    Starting,
    Watching,
    Errored,
    Backoff,
    Stopped,
}

/// Runs watches and publishes what they observe.
#[derive(Clone, Debug)]
pub struct WatchIngestor {
    dispatcher: ProxyDispatcher,
    hub: EventHub,
    config: WatchConfig,
    metrics: WatchMetrics,
}

/// Controls a running watch loop. Dropping the handle does not stop the loop.
#[derive(Debug)]
pub struct WatchHandle {
    cancel: CancellationToken,
    state: watch::Receiver<WatchState>,
    task: JoinHandle<()>,
}

struct WatchLoop {
    ingestor: WatchIngestor,
    cluster: ClusterId,
    resource: ResourceType,
    state: watch::Sender<WatchState>,
    cancel: CancellationToken,
    backoff: Backoff,
    resource_version: Option<String>,
}

enum Ended {
    Cancelled,
    /// The server closed the watch. Carries whether anything was observed.
    Closed(bool),
    Failed(Error),
}

// === impl WatchConfig ===

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            backoff_min: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

// === impl WatchIngestor ===

impl WatchIngestor {
    pub fn new(
        dispatcher: ProxyDispatcher,
        hub: EventHub,
        config: WatchConfig,
        metrics: WatchMetrics,
    ) -> Self {
        Self {
            dispatcher,
            hub,
            config,
            metrics,
        }
    }

    pub fn dispatcher(&self) -> &ProxyDispatcher {
        &self.dispatcher
    }

    /// Starts watching a resource on a cluster.
    pub fn spawn(&self, cluster: ClusterId, resource: ResourceType) -> WatchHandle {
        let (state_tx, state) = watch::channel(WatchState::Starting);
        let cancel = CancellationToken::new();
        let span = info_span!("watch", %cluster, %resource);
        let watch = WatchLoop {
            ingestor: self.clone(),
            backoff: Backoff::new(self.config.backoff_min, self.config.backoff_max),
            cluster,
            resource,
            state: state_tx,
            cancel: cancel.clone(),
            resource_version: None,
        };
        let task = tokio::spawn(watch.run().instrument(span));
        WatchHandle {
            cancel,
            state,
            task,
        }
    }
}

// === impl WatchHandle ===

impl WatchHandle {
    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    /// Asks the loop to stop. The loop releases its watch promptly.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Completes when the loop has stopped.
    pub async fn stopped(mut self) {
        let _ = self.state.wait_for(|s| *s == WatchState::Stopped).await;
        let _ = self.task.await;
    }
}

// === impl WatchLoop ===

impl WatchLoop {
    async fn run(mut self) {
        loop {
            self.state.send_replace(WatchState::Starting);
            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                res = self.open() => res,
            };

            let error = match opened {
                Ok(stream) => {
                    self.state.send_replace(WatchState::Watching);
                    debug!(resource_version = ?self.resource_version, "Watching");
                    match self.consume(stream).await {
                        Ended::Cancelled => break,
                        Ended::Closed(true) => continue,
                        Ended::Closed(false) => {
                            debug!("Watch closed without progress");
                            None
                        }
                        Ended::Failed(error) => Some(error),
                    }
                }
                Err(error) if error.is_unavailable() => {
                    info!(%error, "Cluster unavailable; stopping watch");
                    break;
                }
                Err(error) => Some(error),
            };

            self.state.send_replace(WatchState::Errored);
            match error {
                Some(Error::Upstream { status, .. }) if status == StatusCode::GONE => {
                    debug!("Resource version expired; relisting");
                    self.resource_version = None;
                }
                Some(error) => warn!(%error, "Watch failed"),
                None => {}
            }
            self.ingestor.metrics.restarted(&self.cluster);

            self.state.send_replace(WatchState::Backoff);
            let delay = self.backoff.next_delay();
            debug!(?delay, "Restarting watch after backoff");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = time::sleep(delay) => {}
            }
        }

        debug!("Watch stopped");
        self.state.send_replace(WatchState::Stopped);
    }

    async fn open(&self) -> Result<WatchStream, Error> {
        self.ingestor
            .dispatcher
            .watch(
                &self.cluster,
                &self.resource,
                None,
                self.resource_version.as_deref(),
            )
            .await
    }

    async fn consume(&mut self, mut stream: WatchStream) -> Ended {
        let mut progress = false;
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ended::Cancelled,
                item = stream.next() => item,
            };
            let raw = match item {
                None => return Ended::Closed(progress),
                Some(Ok(raw)) => raw,
                Some(Err(error)) => return Ended::Failed(error),
            };

            match raw {
                RawWatchEvent::Bookmark(bookmark) => {
                    self.resource_version = Some(bookmark.metadata.resource_version);
                }
                RawWatchEvent::Error(status) => {
                    return Ended::Failed(Error::Upstream {
                        status: StatusCode::from_u16(status.code)
                            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                        body: status.message.into(),
                    });
                }
                raw => {
                    let cluster = self.cluster.clone();
                    if let Some(event) = WatchEvent::from_raw(cluster, self.resource.clone(), raw) {
                        if event.resource_version.is_some() {
                            self.resource_version = event.resource_version.clone();
                        }
                        self.ingestor.metrics.observed(&self.cluster);
                        self.ingestor.hub.publish(event);
                    }
                }
            }
            if !progress {
                progress = true;
                self.backoff.reset();
            }
        }
    }
}
