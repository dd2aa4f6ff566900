//! In-memory collaborators for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::brokers::{Broker, BrokerConfig, BrokerContext, ConnectorIdentity, Message, Metadata, Subscription, SubscriptionError};
use crate::control::ControlPlane;
use crate::runtime::{Execution, FeatureStore, ProgramSpec, Runtime, RuntimeError};
use crate::schema::SchemaFetcher;
use crate::utils::{Keys, Row};
use runner_core::config::ParsedConfig;
use runner_core::crd::{Feature, FeatureBuilder, FeatureSpec, ResourceReference, SecretKeyRef};
use runner_core::AppError;

pub const CLICK_PROTO_URL: &str = "https://schemas.example.com/shop/click.proto";

pub const CLICK_PROTO: &str = r#"
syntax = "proto3";
package shop.v1;
message Click {
  string user_id = 1;
  int64 amount = 2;
  Geo geo = 3;
  message Geo {
    string zip = 1;
  }
}
"#;

/// Poll the given condition until it holds, failing after a few seconds.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut cond: F) -> Result<()> {
    for _ in 0..200 {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timeout waiting for {}", what)
}

/// Lock a std mutex, ignoring poisoning.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

/////////////////////////////////////////////////////////////////////////////
// Broker ///////////////////////////////////////////////////////////////////

/// The native representation of a message delivered by a `MemorySubscription`.
#[derive(Clone, Debug)]
pub struct MemoryRecord {
    pub id: String,
    pub topic: String,
    pub timestamp: Option<OffsetDateTime>,
}

/// A broker whose subscriptions are fed by the test.
#[derive(Default)]
pub struct MemoryBroker {
    /// Reject negative acknowledgements on all subscriptions.
    pub ack_only: bool,
    subscriptions: Mutex<Vec<Arc<MemorySubscription>>>,
}

impl MemoryBroker {
    /// Create a broker whose subscriptions do not support nack.
    pub fn ack_only() -> Self {
        Self { ack_only: true, ..Default::default() }
    }

    /// All subscriptions opened so far, in order.
    pub fn subscriptions(&self) -> Vec<Arc<MemorySubscription>> {
        lock(&self.subscriptions).clone()
    }

    /// The most recently opened subscription.
    pub fn latest(&self) -> Option<Arc<MemorySubscription>> {
        lock(&self.subscriptions).last().cloned()
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    fn parse_config(&self, _: &ConnectorIdentity, config: &ParsedConfig) -> Result<BrokerConfig, AppError> {
        if config.get("fail").is_some() {
            return Err(AppError::InvalidConfig("fail is set".into()));
        }
        Ok(BrokerConfig::Custom(config.clone()))
    }

    async fn subscribe(&self, config: BrokerConfig, token: CancellationToken) -> Result<(BrokerContext, Arc<dyn Subscription>)> {
        let topic = match &config {
            BrokerConfig::Custom(config) => config.get("topic").unwrap_or("memory").to_string(),
            _ => bail!("unexpected config for memory broker"),
        };
        let sub = Arc::new(MemorySubscription::new(!self.ack_only, token));
        lock(&self.subscriptions).push(sub.clone());
        let ctx = BrokerContext {
            topic: Some(topic),
        };
        Ok((ctx, sub))
    }

    fn metadata(&self, ctx: &BrokerContext, msg: &Message) -> Metadata {
        let record = msg.native::<MemoryRecord>();
        Metadata {
            topic: record.map(|rec| rec.topic.clone()).or_else(|| ctx.topic.clone()).unwrap_or_default(),
            timestamp: record.and_then(|rec| rec.timestamp),
            id: record.map(|rec| rec.id.clone()).unwrap_or_default(),
        }
    }
}

/// A subscription fed by the test, recording all acknowledgements.
pub struct MemorySubscription {
    nackable: bool,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<Message>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    closed: AtomicBool,
    acked: Mutex<Vec<String>>,
    nacked: Mutex<Vec<String>>,
    late: AtomicUsize,
}

impl MemorySubscription {
    fn new(nackable: bool, token: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            nackable,
            token,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            acked: Default::default(),
            nacked: Default::default(),
            late: Default::default(),
        }
    }

    /// Deliver a message with the given body and ID.
    pub fn push(&self, id: &str, body: impl Into<Vec<u8>>) {
        self.push_at(id, body, None)
    }

    /// Deliver a message with the given body, ID and event time.
    pub fn push_at(&self, id: &str, body: impl Into<Vec<u8>>, timestamp: Option<OffsetDateTime>) {
        let record = MemoryRecord {
            id: id.into(),
            topic: "memory".into(),
            timestamp,
        };
        let _ = self.tx.send(Message::new(body.into(), record));
    }

    pub fn acked(&self) -> Vec<String> {
        lock(&self.acked).clone()
    }

    pub fn nacked(&self) -> Vec<String> {
        lock(&self.nacked).clone()
    }

    /// The number of acknowledgements attempted after shutdown.
    pub fn late_acks(&self) -> usize {
        self.late.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, list: &Mutex<Vec<String>>, msg: &Message) -> Result<(), SubscriptionError> {
        if self.is_closed() {
            self.late.fetch_add(1, Ordering::SeqCst);
            return Err(SubscriptionError::Closed);
        }
        let id = msg.native::<MemoryRecord>().map(|rec| rec.id.clone()).unwrap_or_default();
        lock(list).push(id);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Subscription for MemorySubscription {
    async fn receive(&self) -> Result<Message, SubscriptionError> {
        if self.is_closed() {
            return Err(SubscriptionError::Closed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.token.cancelled() => Err(SubscriptionError::Cancelled),
            msg = rx.recv() => msg.ok_or(SubscriptionError::Closed),
        }
    }

    async fn ack(&self, msg: &Message) -> Result<(), SubscriptionError> {
        self.record(&self.acked, msg)
    }

    async fn nack(&self, msg: &Message) -> Result<(), SubscriptionError> {
        if !self.nackable {
            return Err(SubscriptionError::NackUnsupported);
        }
        self.record(&self.nacked, msg)
    }

    fn nackable(&self) -> bool {
        self.nackable
    }

    async fn shutdown(&self) -> Result<(), SubscriptionError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/////////////////////////////////////////////////////////////////////////////
// Runtime //////////////////////////////////////////////////////////////////

/// A runtime which echoes rows back as feature values.
///
/// The produced value is the row field `value` when present, else the whole row. The entity ID
/// is the key values joined by `|`.
#[derive(Default)]
pub struct MemoryRuntime {
    loads: Mutex<Vec<ProgramSpec>>,
    executions: Mutex<Vec<(String, String)>>,
    failing: Mutex<HashMap<String, String>>,
    failing_loads: Mutex<HashMap<String, String>>,
    misses: Mutex<HashMap<String, usize>>,
    nulls: Mutex<Vec<String>>,
    hangs: Mutex<Vec<String>>,
}

impl MemoryRuntime {
    /// Fail all executions of the given feature.
    pub fn fail(&self, fqn: &str, reason: &str) {
        lock(&self.failing).insert(fqn.into(), reason.into());
    }

    /// Fail all loads of the given feature.
    pub fn fail_load(&self, fqn: &str, reason: &str) {
        lock(&self.failing_loads).insert(fqn.into(), reason.into());
    }

    /// Report the next `count` executions of the given feature as not found.
    pub fn miss(&self, fqn: &str, count: usize) {
        lock(&self.misses).insert(fqn.into(), count);
    }

    /// Produce a null value for all executions of the given feature.
    pub fn produce_null(&self, fqn: &str) {
        lock(&self.nulls).push(fqn.into());
    }

    /// Never complete executions of the given feature.
    pub fn hang(&self, fqn: &str) {
        lock(&self.hangs).push(fqn.into());
    }

    /// All loaded programs, in order.
    pub fn loads(&self) -> Vec<ProgramSpec> {
        lock(&self.loads).clone()
    }

    /// The number of loads of the given feature.
    pub fn load_count(&self, fqn: &str) -> usize {
        lock(&self.loads).iter().filter(|spec| spec.fqn == fqn).count()
    }

    /// All executions as `(program_id, fqn)` pairs, in order.
    pub fn executions(&self) -> Vec<(String, String)> {
        lock(&self.executions).clone()
    }
}

#[async_trait::async_trait]
impl Runtime for MemoryRuntime {
    async fn load_program(&self, spec: &ProgramSpec) -> Result<String, RuntimeError> {
        if let Some(reason) = lock(&self.failing_loads).get(&spec.fqn) {
            return Err(RuntimeError::Other(anyhow::anyhow!("{}", reason)));
        }
        let mut loads = lock(&self.loads);
        loads.push(spec.clone());
        Ok(format!("{}-{}", spec.fqn, loads.len()))
    }

    async fn execute_program(&self, program_id: &str, fqn: &str, keys: &Keys, row: &Row, ts: OffsetDateTime) -> Result<Execution, RuntimeError> {
        lock(&self.executions).push((program_id.into(), fqn.into()));
        let hangs = lock(&self.hangs).iter().any(|name| name == fqn);
        if hangs {
            futures::future::pending::<()>().await;
        }
        if let Some(remaining) = lock(&self.misses).get_mut(fqn) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RuntimeError::NotFound(program_id.into()));
            }
        }
        if let Some(reason) = lock(&self.failing).get(fqn) {
            return Err(RuntimeError::Other(anyhow::anyhow!("{}", reason)));
        }
        let value = if lock(&self.nulls).iter().any(|name| name == fqn) {
            Value::Null
        } else {
            row.get("value").cloned().unwrap_or_else(|| Value::Object(row.clone()))
        };
        Ok(Execution {
            value: Some(value),
            timestamp: ts,
            entity_id: keys.values().cloned().collect::<Vec<_>>().join("|"),
        })
    }
}

/// An update written to a `MemoryStore`.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredUpdate {
    pub fqn: String,
    pub entity_id: String,
    pub value: Value,
    pub timestamp: OffsetDateTime,
}

/// A feature store recording all updates.
#[derive(Default)]
pub struct MemoryStore {
    updates: Mutex<Vec<StoredUpdate>>,
}

impl MemoryStore {
    pub fn updates(&self) -> Vec<StoredUpdate> {
        lock(&self.updates).clone()
    }

    /// All updates of the given feature.
    pub fn updates_of(&self, fqn: &str) -> Vec<StoredUpdate> {
        lock(&self.updates).iter().filter(|update| update.fqn == fqn).cloned().collect()
    }
}

#[async_trait::async_trait]
impl FeatureStore for MemoryStore {
    async fn update(&self, fqn: &str, entity_id: &str, value: &Value, ts: OffsetDateTime) -> Result<()> {
        lock(&self.updates).push(StoredUpdate {
            fqn: fqn.into(),
            entity_id: entity_id.into(),
            value: value.clone(),
            timestamp: ts,
        });
        Ok(())
    }
}

/////////////////////////////////////////////////////////////////////////////
// Control Plane ////////////////////////////////////////////////////////////

/// A control plane serving features and secrets from memory.
#[derive(Default)]
pub struct MemoryControlPlane {
    features: Mutex<HashMap<String, Feature>>,
    secrets: Mutex<HashMap<(String, String, String), String>>,
}

impl MemoryControlPlane {
    /// Add a feature definition.
    pub fn add_feature(&self, feature: Feature) {
        use runner_core::crd::RequiredMetadata;
        let key = format!("{}/{}", feature.namespace(), feature.name());
        lock(&self.features).insert(key, feature);
    }

    /// Add a secret key value.
    pub fn add_secret(&self, namespace: &str, name: &str, key: &str, value: &str) {
        lock(&self.secrets).insert((namespace.into(), name.into(), key.into()), value.into());
    }
}

#[async_trait::async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn get_feature(&self, reference: &ResourceReference) -> Result<Feature> {
        lock(&self.features).get(&reference.to_string()).cloned().with_context(|| format!("feature {} not found", reference))
    }

    async fn get_secret_value(&self, namespace: &str, reference: &SecretKeyRef) -> Result<String> {
        let key = (namespace.to_string(), reference.name.clone(), reference.key.clone());
        lock(&self.secrets).get(&key).cloned().with_context(|| format!("secret {}/{} not found", namespace, reference.name))
    }
}

/// Build a feature definition of the streaming kind.
pub fn streaming_feature(name: &str, namespace: &str, keys: &[&str], schema: Option<&str>) -> Feature {
    feature_of_kind(name, namespace, "streaming", keys, schema)
}

/// Build a feature definition of the given builder kind.
pub fn feature_of_kind(name: &str, namespace: &str, kind: &str, keys: &[&str], schema: Option<&str>) -> Feature {
    let mut feature = Feature::new(
        name,
        FeatureSpec {
            keys: keys.iter().map(|key| key.to_string()).collect(),
            builder: FeatureBuilder {
                kind: kind.into(),
                code: format!("def {}(row): return row", name),
                packages: vec![],
                schema: schema.map(String::from),
                runtime: None,
            },
        },
    );
    feature.metadata.namespace = Some(namespace.into());
    feature
}

/////////////////////////////////////////////////////////////////////////////
// Schemas //////////////////////////////////////////////////////////////////

/// A schema fetcher serving sources from memory.
#[derive(Default)]
pub struct MemoryFetcher {
    sources: Mutex<HashMap<String, String>>,
    fetches: AtomicUsize,
}

impl MemoryFetcher {
    /// Create a fetcher serving the given `(locator, source)` pairs.
    pub fn new(sources: Vec<(&str, &str)>) -> Self {
        let fetcher = Self::default();
        for (locator, source) in sources {
            fetcher.insert(locator, source);
        }
        fetcher
    }

    /// Serve the given source at the given locator.
    pub fn insert(&self, locator: &str, source: &str) {
        lock(&self.sources).insert(locator.into(), source.into());
    }

    /// The number of fetches performed.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SchemaFetcher for MemoryFetcher {
    async fn fetch(&self, locator: &Url) -> Result<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut locator = locator.clone();
        locator.set_fragment(None);
        lock(&self.sources).get(locator.as_str()).cloned().with_context(|| format!("no schema at {}", locator))
    }
}
