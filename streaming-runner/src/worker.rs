//! Message processing workers.
//!
//! Each worker of a generation runs an independent receive, decode, execute and acknowledge
//! loop against the generation's shared subscription and feature catalog.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::brokers::{Broker, BrokerContext, Message, Metadata, Subscription, SubscriptionError};
use crate::error::PipelineError;
use crate::features::{FeatureCatalog, FeatureProgram};
use crate::runtime::FeatureStore;
use crate::schema::{self, SchemaRegistry};
use crate::utils::{self, Row};

pub const METRIC_MESSAGES_RECEIVED: &str = "runner_messages_received";
pub const METRIC_MESSAGES_ACKED: &str = "runner_messages_acked";
pub const METRIC_MESSAGES_NACKED: &str = "runner_messages_nacked";
pub const METRIC_FEATURE_UPDATES: &str = "runner_feature_updates";
pub const METRIC_FEATURE_FAILURES: &str = "runner_feature_failures";

/// Register the metrics of the worker pool.
pub fn register_metrics() {
    metrics::register_counter!(METRIC_MESSAGES_RECEIVED, metrics::Unit::Count, "messages received from the subscription");
    metrics::register_counter!(METRIC_MESSAGES_ACKED, metrics::Unit::Count, "messages positively acknowledged");
    metrics::register_counter!(METRIC_MESSAGES_NACKED, metrics::Unit::Count, "messages negatively acknowledged");
    metrics::register_counter!(METRIC_FEATURE_UPDATES, metrics::Unit::Count, "feature values forwarded to the feature store");
    metrics::register_counter!(METRIC_FEATURE_FAILURES, metrics::Unit::Count, "feature evaluations which failed");
}

/// Everything the workers of a generation share.
pub struct WorkerContext {
    pub broker: Arc<dyn Broker>,
    pub broker_ctx: BrokerContext,
    pub subscription: Arc<dyn Subscription>,
    pub catalog: Arc<FeatureCatalog>,
    pub schemas: Arc<SchemaRegistry>,
    pub store: Arc<dyn FeatureStore>,
}

/// A single consumer of a generation's subscription.
pub struct Worker {
    /// The index of this worker within its generation.
    id: usize,
    /// The generation this worker belongs to.
    generation: u64,
    ctx: Arc<WorkerContext>,
    /// The cancellation scope of the generation.
    token: CancellationToken,
}

impl Worker {
    /// Create a new instance.
    pub fn new(id: usize, generation: u64, ctx: Arc<WorkerContext>, token: CancellationToken) -> Self {
        Self { id, generation, ctx, token }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        tracing::debug!(worker = self.id, generation = self.generation, "worker has started");
        loop {
            let res = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                res = self.ctx.subscription.receive() => res,
            };
            let msg = match res {
                Ok(msg) => msg,
                Err(SubscriptionError::Cancelled | SubscriptionError::Closed) => break,
                Err(err) => {
                    tracing::error!(error = ?err, worker = self.id, "failed to receive message");
                    break;
                }
            };
            metrics::increment_counter!(METRIC_MESSAGES_RECEIVED);
            self.ctx.process(msg).await;
        }
        tracing::debug!(worker = self.id, generation = self.generation, "worker has shutdown");
    }
}

impl WorkerContext {
    /// Process a single message and acknowledge it.
    ///
    /// Messages are positively acknowledged once every feature has been attempted, whatever the
    /// outcome of the individual features. Only a failure which prevents any feature from being
    /// attempted leads to a negative acknowledgement.
    #[tracing::instrument(level = "debug", skip(self, msg))]
    pub async fn process(&self, msg: Message) {
        let mut meta = self.broker.metadata(&self.broker_ctx, &msg);
        let ts = *meta.timestamp.get_or_insert_with(OffsetDateTime::now_utc);

        match self.evaluate(&msg, &meta, ts).await {
            Ok(()) => self.ack(&msg, &meta).await,
            Err(err) => {
                tracing::error!(error = ?err, id = %meta.id, topic = %meta.topic, "failed to handle message");
                if self.subscription.nackable() {
                    match self.subscription.nack(&msg).await {
                        Ok(()) => metrics::increment_counter!(METRIC_MESSAGES_NACKED),
                        Err(err) => tracing::error!(error = ?err, id = %meta.id, "error nacking message"),
                    }
                } else {
                    self.ack(&msg, &meta).await;
                }
            }
        }
    }

    async fn ack(&self, msg: &Message, meta: &Metadata) {
        match self.subscription.ack(msg).await {
            Ok(()) => metrics::increment_counter!(METRIC_MESSAGES_ACKED),
            Err(err) => tracing::error!(error = ?err, id = %meta.id, "error acking message"),
        }
    }

    /// Evaluate every feature of the catalog against the given message.
    ///
    /// Rows are decoded once per distinct schema. Errors are isolated to the feature which raised
    /// them, unless no feature could be attempted at all.
    async fn evaluate(&self, msg: &Message, meta: &Metadata, ts: OffsetDateTime) -> Result<()> {
        let programs = self.catalog.programs();
        let mut rows: HashMap<Option<&str>, Result<Arc<Row>, Arc<anyhow::Error>>> = HashMap::new();
        let mut attempted = 0;
        let mut decode_failure = None;

        for program in programs {
            let key = program.schema.as_ref().map(|schema| schema.message.as_str());
            if !rows.contains_key(&key) {
                let decoded = self.decode(program, &msg.body).await.map(Arc::new).map_err(Arc::new);
                rows.insert(key, decoded);
            }
            let row = match rows.get(&key) {
                Some(Ok(row)) => row.clone(),
                Some(Err(err)) => {
                    tracing::error!(error = ?err, fqn = %program.fqn, id = %meta.id, "failed to decode message for feature");
                    metrics::increment_counter!(METRIC_FEATURE_FAILURES);
                    decode_failure = Some(err.clone());
                    continue;
                }
                None => continue,
            };

            attempted += 1;
            if let Err(err) = self.run_feature(program, &row, ts).await {
                tracing::error!(error = ?err, fqn = %program.fqn, id = %meta.id, "failed to evaluate feature");
                metrics::increment_counter!(METRIC_FEATURE_FAILURES);
            }
        }

        match decode_failure {
            Some(err) if attempted == 0 => Err(anyhow!("{:#}", err).context("no feature could decode the message")),
            _ => Ok(()),
        }
    }

    /// Decode the message body into a flattened row, with the program's schema if it has one.
    async fn decode(&self, program: &FeatureProgram, body: &[u8]) -> Result<Row> {
        match &program.schema {
            Some(bound) => {
                let descriptor = self.schemas.resolve_or_register(bound).await.context("error resolving message schema")?;
                Ok(schema::decode(&descriptor, body)?)
            }
            None => Ok(utils::row_from_json(body)?),
        }
    }

    /// Execute a single feature program and forward its value to the feature store.
    async fn run_feature(&self, program: &FeatureProgram, row: &Row, ts: OffsetDateTime) -> Result<()> {
        let keys = utils::extract_keys(row, &program.keys)?;
        let execution = self.catalog.execute(program, &keys, row, ts).await.context("failed to execute feature")?;
        let value = match execution.value {
            Some(value) if !value.is_null() => value,
            _ => {
                tracing::debug!(fqn = %program.fqn, "feature program produced no value");
                return Ok(());
            }
        };
        if execution.entity_id.is_empty() {
            return Err(PipelineError::MissingEntityId.into());
        }
        self.store
            .update(&program.fqn, &execution.entity_id, &value, execution.timestamp)
            .await
            .context("error updating feature store")?;
        metrics::increment_counter!(METRIC_FEATURE_UPDATES);
        Ok(())
    }
}
