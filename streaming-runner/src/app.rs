use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::brokers;
use crate::config::Config;
use crate::control::KubeControlPlane;
use crate::manager::{Collaborators, ConnectorManager};
use crate::runtime::{GrpcFeatureStore, GrpcRuntime};
use crate::schema::{HttpFetcher, SchemaRegistry};
use crate::server::spawn_metrics_server;
use crate::watchers::ConnectorWatcher;

/// The application object of the streaming runner.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the connector manager.
    manager_handle: JoinHandle<Result<()>>,
    /// The join handle of the connector CR watcher.
    watcher_handle: JoinHandle<Result<()>>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        // Initialize K8s client.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;

        let deps = Collaborators {
            brokers: Arc::new(brokers::builtin().context("error registering builtin brokers")?),
            schemas: Arc::new(SchemaRegistry::new(Arc::new(HttpFetcher::default()))),
            control: Arc::new(KubeControlPlane::new(client.clone())),
            runtime: Arc::new(GrpcRuntime::new(&config.runtime_grpc_addr, config.grpc_timeout()).context("error setting up runtime client")?),
            store: Arc::new(GrpcFeatureStore::new(&config.core_grpc_addr, config.grpc_timeout()).context("error setting up feature store client")?),
        };

        // Spawn various core tasks.
        let (shutdown_tx, _) = broadcast::channel(10);
        let (events_tx, events_rx) = mpsc::channel(100);
        let manager_handle = ConnectorManager::new(deps, events_rx, shutdown_tx.clone())
            .with_retire_grace(config.retire_grace())
            .spawn();
        let watcher_handle = ConnectorWatcher::new(client, config.clone(), events_tx, shutdown_tx.subscribe()).spawn();
        let metrics_server = spawn_metrics_server(metrics, config.metrics_port, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            manager_handle,
            watcher_handle,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("streaming runner is shutting down");
        if let Err(err) = self.watcher_handle.await.context("error joining connector watcher handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down connector watcher");
        }
        if let Err(err) = self.manager_handle.await.context("error joining connector manager handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down connector manager");
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }

        tracing::debug!("streaming runner shutdown complete");
        Ok(())
    }
}
