//! Connector lifecycle manager.
//!
//! The manager reacts to the events of the watched connector and owns its active generation: the
//! subscription, the feature catalog and the worker pool, all scoped to one cancellation token.
//! A generation is always fully retired before the next one is started.

#[cfg(test)]
mod mod_test;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_util::sync::CancellationToken;

use crate::brokers::{BrokerRegistry, ConnectorIdentity, Subscription};
use crate::control::ControlPlane;
use crate::features::FeatureCatalog;
use crate::runtime::{FeatureStore, Runtime};
use crate::schema::SchemaRegistry;
use crate::worker::{self, Worker, WorkerContext};
use runner_core::config::{ParsedConfig, StreamingConfig};
use runner_core::crd::{DataConnector, RequiredMetadata};
use runner_core::AppError;

const METRIC_GENERATIONS_STARTED: &str = "runner_generations_started";
const METRIC_GENERATIONS_FAILED: &str = "runner_generations_failed";
const METRIC_WORKERS_ABORTED: &str = "runner_workers_aborted";

/// The default time a retired generation's workers have to exit before being aborted.
const DEFAULT_RETIRE_GRACE: Duration = Duration::from_secs(30);

/// An event of the watched connector resource.
#[derive(Clone, Debug)]
pub enum ConnectorEvent {
    Created(Arc<DataConnector>),
    Updated { old: Arc<DataConnector>, new: Arc<DataConnector> },
    Deleted(Arc<DataConnector>),
}

/// The collaborators shared by all generations.
#[derive(Clone)]
pub struct Collaborators {
    pub brokers: Arc<BrokerRegistry>,
    pub schemas: Arc<SchemaRegistry>,
    pub control: Arc<dyn ControlPlane>,
    pub runtime: Arc<dyn Runtime>,
    pub store: Arc<dyn FeatureStore>,
}

/// A running instance of a connector's pipeline.
struct Generation {
    id: u64,
    token: CancellationToken,
    subscription: Arc<dyn Subscription>,
    workers: Vec<JoinHandle<()>>,
}

/// A controller managing the lifecycle of a connector's pipeline.
pub struct ConnectorManager {
    deps: Collaborators,
    /// The parent of all generation scopes.
    root: CancellationToken,
    /// The ID of the last generation to have been started.
    last_generation: u64,
    /// The active generation, if any.
    active: Option<Generation>,
    /// The time a retired generation's workers have to exit before being aborted.
    retire_grace: Duration,

    /// A channel of connector events.
    events_rx: ReceiverStream<ConnectorEvent>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl ConnectorManager {
    /// Create a new instance.
    pub fn new(deps: Collaborators, events_rx: mpsc::Receiver<ConnectorEvent>, shutdown_tx: broadcast::Sender<()>) -> Self {
        metrics::register_counter!(METRIC_GENERATIONS_STARTED, metrics::Unit::Count, "connector generations started");
        metrics::register_counter!(METRIC_GENERATIONS_FAILED, metrics::Unit::Count, "connector generations which failed to start");
        metrics::register_counter!(METRIC_WORKERS_ABORTED, metrics::Unit::Count, "workers aborted after exceeding the retire grace period");
        worker::register_metrics();
        Self {
            deps,
            root: CancellationToken::new(),
            last_generation: 0,
            active: None,
            retire_grace: DEFAULT_RETIRE_GRACE,
            events_rx: ReceiverStream::new(events_rx),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        }
    }

    /// Set the time a retired generation's workers have to exit before being aborted.
    pub fn with_retire_grace(mut self, grace: Duration) -> Self {
        self.retire_grace = grace;
        self
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("connector manager has started");

        loop {
            tokio::select! {
                Some(event) = self.events_rx.next() => self.handle_event(event).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        self.retire().await;
        self.root.cancel();
        tracing::debug!("connector manager has shutdown");
        Ok(())
    }

    /// The ID of the active generation, if any.
    pub fn active_generation(&self) -> Option<u64> {
        self.active.as_ref().map(|generation| generation.id)
    }

    /// Handle a connector event.
    #[tracing::instrument(level = "debug", skip(self, event))]
    pub async fn handle_event(&mut self, event: ConnectorEvent) {
        match event {
            ConnectorEvent::Created(conn) | ConnectorEvent::Updated { new: conn, .. } => {
                self.retire().await;
                self.start(&conn).await;
            }
            ConnectorEvent::Deleted(conn) => {
                tracing::info!(connector = %conn.name(), "connector deleted, closing active generation");
                self.retire().await;
            }
        }
    }

    /// Start a new generation of the given connector, staying idle on failure.
    async fn start(&mut self, conn: &DataConnector) {
        let id = self.last_generation + 1;
        match self.build_generation(id, conn).await {
            Ok(generation) => {
                tracing::info!(generation = id, workers = generation.workers.len(), "connector generation started");
                metrics::increment_counter!(METRIC_GENERATIONS_STARTED);
                self.last_generation = id;
                self.active = Some(generation);
            }
            Err(err) => {
                tracing::error!(error = ?err, connector = %conn.name(), namespace = %conn.namespace(), "failed to start connector");
                metrics::increment_counter!(METRIC_GENERATIONS_FAILED);
            }
        }
    }

    async fn build_generation(&self, id: u64, conn: &DataConnector) -> Result<Generation> {
        let identity = ConnectorIdentity {
            name: conn.name().to_string(),
            namespace: conn.namespace().to_string(),
        };
        let config = self.parse_config(conn).await?;
        let streaming = StreamingConfig::from_parsed(&config)?;
        let broker = self
            .deps
            .brokers
            .get(&conn.spec.kind)
            .ok_or_else(|| AppError::ResourceNotFound(format!("broker {} (registered: {})", conn.spec.kind, self.deps.brokers.kinds().join(", "))))?;
        let broker_config = broker.parse_config(&identity, &config)?;
        let default_schema = match streaming.schema.as_deref() {
            Some(reference) => Some(
                self.deps
                    .schemas
                    .connector_schema(reference)
                    .await
                    .context("failed to register connector schema")?,
            ),
            None => None,
        };

        let token = self.root.child_token();
        let (broker_ctx, subscription) = broker
            .subscribe(broker_config, token.clone())
            .await
            .with_context(|| format!("failed to create {} subscription", conn.spec.kind))?;
        let catalog = FeatureCatalog::build(
            conn.feature_refs(),
            &identity.namespace,
            default_schema.as_ref(),
            self.deps.control.as_ref(),
            &self.deps.schemas,
            self.deps.runtime.clone(),
        )
        .await;
        if catalog.programs().is_empty() {
            tracing::warn!(connector = %identity, "connector has no loadable features, messages will be drained");
        }

        let ctx = Arc::new(WorkerContext {
            broker,
            broker_ctx,
            subscription: subscription.clone(),
            catalog: Arc::new(catalog),
            schemas: self.deps.schemas.clone(),
            store: self.deps.store.clone(),
        });
        let workers = (0..streaming.workers).map(|idx| Worker::new(idx, id, ctx.clone(), token.clone()).spawn()).collect();
        Ok(Generation {
            id,
            token,
            subscription,
            workers,
        })
    }

    /// Resolve the connector's config vars, reading secret backed values from the control plane.
    async fn parse_config(&self, conn: &DataConnector) -> Result<ParsedConfig> {
        let mut config = ParsedConfig::new();
        for var in conn.spec.config.iter() {
            let value = match (&var.value, &var.secret_key_ref) {
                (Some(value), _) => value.clone(),
                (None, Some(secret)) => self
                    .deps
                    .control
                    .get_secret_value(conn.namespace(), secret)
                    .await
                    .with_context(|| format!("failed to resolve config var {}", var.name))?,
                (None, None) => return Err(AppError::InvalidConfig(format!("config var {} has no value", var.name)).into()),
            };
            config.insert(&var.name, value);
        }
        Ok(config)
    }

    /// Retire the active generation, waiting for its workers to exit and its subscription to shut down.
    ///
    /// Workers still running once the grace period has elapsed are aborted.
    async fn retire(&mut self) {
        let generation = match self.active.take() {
            Some(generation) => generation,
            None => return,
        };
        tracing::debug!(generation = generation.id, "retiring connector generation");
        generation.token.cancel();
        let deadline = tokio::time::Instant::now() + self.retire_grace;
        for mut handle in generation.workers {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(res) => {
                    if let Err(err) = res.context("error joining worker handle") {
                        tracing::error!(error = ?err, generation = generation.id, "error shutting down worker");
                    }
                }
                Err(_) => {
                    tracing::warn!(generation = generation.id, "worker did not exit within the retire grace period, aborting");
                    metrics::increment_counter!(METRIC_WORKERS_ABORTED);
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }
        if let Err(err) = generation.subscription.shutdown().await {
            tracing::error!(error = ?err, generation = generation.id, "failed to shutdown subscription");
        }
        tracing::info!(generation = generation.id, "connector generation retired");
    }
}
