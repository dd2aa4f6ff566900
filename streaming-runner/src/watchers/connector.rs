use std::sync::Arc;

use anyhow::Result;
use futures::stream::StreamExt;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::manager::ConnectorEvent;
use runner_core::crd::DataConnector;

const METRIC_CONNECTOR_WATCHER_ERRORS: &str = "runner_connector_watcher_errors";

/// A result type used for CR events coming from K8s.
pub type ConnectorCREventResult = std::result::Result<Event<DataConnector>, WatcherError>;

/// A K8s event watcher of the runner's DataConnector CR.
pub struct ConnectorWatcher {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,

    /// The channel of connector events consumed by the manager.
    events_tx: mpsc::Sender<ConnectorEvent>,
    /// The translation state of K8s events into connector events.
    tracker: ConnectorTracker,
}

impl ConnectorWatcher {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, events_tx: mpsc::Sender<ConnectorEvent>, shutdown: broadcast::Receiver<()>) -> Self {
        let shutdown = BroadcastStream::new(shutdown);
        metrics::register_counter!(METRIC_CONNECTOR_WATCHER_ERRORS, metrics::Unit::Count, "k8s watcher errors from the connector watcher");
        Self {
            client,
            config,
            shutdown,
            events_tx,
            tracker: Default::default(),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let api: Api<DataConnector> = Api::namespaced(self.client.clone(), &self.config.data_connector_namespace);
        let params = ListParams {
            field_selector: Some(format!("metadata.name={}", &self.config.data_connector_resource)),
            ..Default::default()
        };
        let stream = watcher(api, params);
        tokio::pin!(stream);

        tracing::info!("data connector CR watcher initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = stream.next() => self.handle_k8s_event(k8s_event_res).await,
                _ = self.shutdown.next() => break,
            }
        }

        Ok(())
    }

    /// Handle watcher events coming from K8s.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_k8s_event(&mut self, res: ConnectorCREventResult) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from k8s watch stream");
                metrics::increment_counter!(METRIC_CONNECTOR_WATCHER_ERRORS);
                let _ = tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                return;
            }
        };
        for event in self.tracker.observe(event) {
            if self.events_tx.send(event).await.is_err() {
                tracing::error!("connector manager is gone, dropping connector event");
                return;
            }
        }
    }
}

/// Translates K8s watcher events of a single connector into lifecycle events.
#[derive(Default)]
pub struct ConnectorTracker {
    /// The last observed state of the connector.
    last: Option<Arc<DataConnector>>,
}

impl ConnectorTracker {
    /// Observe a watcher event, returning the lifecycle events it implies.
    pub fn observe(&mut self, event: Event<DataConnector>) -> Vec<ConnectorEvent> {
        match event {
            Event::Applied(conn) => self.apply(conn).into_iter().collect(),
            Event::Deleted(conn) => {
                self.last = None;
                vec![ConnectorEvent::Deleted(Arc::new(conn))]
            }
            Event::Restarted(conns) => {
                tracing::debug!("data connector CR watcher restarted");
                match conns.into_iter().next() {
                    Some(conn) => self.apply(conn).into_iter().collect(),
                    None => self.last.take().map(ConnectorEvent::Deleted).into_iter().collect(),
                }
            }
        }
    }

    /// Record the given state, ignoring changes which touch neither spec nor status.
    fn apply(&mut self, conn: DataConnector) -> Option<ConnectorEvent> {
        let new = Arc::new(conn);
        match self.last.replace(new.clone()) {
            None => Some(ConnectorEvent::Created(new)),
            Some(old) if old.spec == new.spec && old.status == new.status => None,
            Some(old) => Some(ConnectorEvent::Updated { old, new }),
        }
    }
}
