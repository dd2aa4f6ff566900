use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};

use super::*;
use crate::brokers::BrokerRegistry;
use crate::fixtures::{streaming_feature, wait_until, MemoryBroker, MemoryControlPlane, MemoryFetcher, MemoryRuntime, MemoryStore};
use runner_core::crd::{ConfigVar, DataConnectorSpec, DataConnectorStatus, ResourceReference, SecretKeyRef};

struct Harness {
    manager: ConnectorManager,
    broker: Arc<MemoryBroker>,
    control: Arc<MemoryControlPlane>,
    runtime: Arc<MemoryRuntime>,
    store: Arc<MemoryStore>,
    events_tx: mpsc::Sender<ConnectorEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

fn harness() -> Result<Harness> {
    let broker = Arc::new(MemoryBroker::default());
    let mut builder = BrokerRegistry::builder();
    builder.register("memory", broker.clone())?;
    let control = Arc::new(MemoryControlPlane::default());
    control.add_feature(streaming_feature("clicks", "default", &["user_id"], None));
    let runtime = Arc::new(MemoryRuntime::default());
    let store = Arc::new(MemoryStore::default());
    let deps = Collaborators {
        brokers: Arc::new(builder.build()),
        schemas: Arc::new(SchemaRegistry::new(Arc::new(MemoryFetcher::default()))),
        control: control.clone(),
        runtime: runtime.clone(),
        store: store.clone(),
    };
    let (events_tx, events_rx) = mpsc::channel(10);
    let (shutdown_tx, _) = broadcast::channel(1);
    let manager = ConnectorManager::new(deps, events_rx, shutdown_tx.clone());
    Ok(Harness {
        manager,
        broker,
        control,
        runtime,
        store,
        events_tx,
        shutdown_tx,
    })
}

fn connector(kind: &str, config: Vec<ConfigVar>) -> Arc<DataConnector> {
    let mut conn = DataConnector::new("clicks-conn", DataConnectorSpec { kind: kind.into(), config, replicas: None });
    conn.metadata.namespace = Some("default".into());
    conn.status = Some(DataConnectorStatus {
        features: vec![ResourceReference { name: "clicks".into(), namespace: None }],
    });
    Arc::new(conn)
}

fn var(name: &str, value: &str) -> ConfigVar {
    ConfigVar {
        name: name.into(),
        value: Some(value.into()),
        secret_key_ref: None,
    }
}

#[tokio::test]
async fn created_connectors_start_consuming() -> Result<()> {
    let mut h = harness()?;
    h.manager.handle_event(ConnectorEvent::Created(connector("memory", vec![var("workers", "2")]))).await;
    assert_eq!(h.manager.active_generation(), Some(1), "expected generation 1 to be active");

    let sub = h.broker.latest().context("expected a subscription to be opened")?;
    sub.push("m1", r#"{"user_id":"42","value":3}"#);
    wait_until("message to be acked", || sub.acked() == vec!["m1"]).await?;
    let updates = h.store.updates_of("clicks.default");
    assert_eq!(updates.len(), 1, "expected one update, got {:?}", updates);
    assert_eq!(updates[0].entity_id, "42", "unexpected entity id, got {}", updates[0].entity_id);
    Ok(())
}

#[tokio::test]
async fn updates_fully_retire_the_previous_generation() -> Result<()> {
    let mut h = harness()?;
    h.manager.handle_event(ConnectorEvent::Created(connector("memory", vec![]))).await;
    let old = connector("memory", vec![]);
    let new = connector("memory", vec![var("workers", "3")]);
    h.manager.handle_event(ConnectorEvent::Updated { old, new }).await;
    assert_eq!(h.manager.active_generation(), Some(2), "expected generation 2 to be active");

    let subs = h.broker.subscriptions();
    assert_eq!(subs.len(), 2, "expected two subscriptions, got {}", subs.len());
    assert!(subs[0].is_closed(), "expected the first generation's subscription to be shut down");
    assert!(!subs[1].is_closed(), "expected the second generation's subscription to be open");

    subs[0].push("old", r#"{"user_id":"1"}"#);
    subs[1].push("new", r#"{"user_id":"2"}"#);
    wait_until("message to be acked", || subs[1].acked() == vec!["new"]).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(subs[0].acked().is_empty(), "expected no acks on the retired subscription, got {:?}", subs[0].acked());
    assert_eq!(subs[0].late_acks(), 0, "expected no acks attempted after shutdown, got {}", subs[0].late_acks());
    Ok(())
}

#[tokio::test]
async fn deleted_connectors_become_idle() -> Result<()> {
    let mut h = harness()?;
    let conn = connector("memory", vec![]);
    h.manager.handle_event(ConnectorEvent::Created(conn.clone())).await;
    h.manager.handle_event(ConnectorEvent::Deleted(conn)).await;

    assert_eq!(h.manager.active_generation(), None, "expected no active generation");
    let sub = h.broker.latest().context("expected a subscription to be opened")?;
    assert!(sub.is_closed(), "expected the subscription to be shut down");
    Ok(())
}

#[tokio::test]
async fn unknown_brokers_leave_the_connector_idle() -> Result<()> {
    let mut h = harness()?;
    let res = h.manager.build_generation(1, &connector("rabbitmq", vec![])).await;
    let err = res.err().context("expected an unknown broker to fail the generation")?;
    assert_eq!(
        err.to_string(),
        AppError::ResourceNotFound("broker rabbitmq (registered: memory)".into()).to_string(),
        "unexpected error, got {}",
        err
    );
    h.manager.handle_event(ConnectorEvent::Created(connector("rabbitmq", vec![]))).await;

    assert_eq!(h.manager.active_generation(), None, "expected no active generation");
    assert!(h.broker.subscriptions().is_empty(), "expected no subscription to be opened");
    Ok(())
}

#[tokio::test]
async fn invalid_updates_retire_and_stay_idle() -> Result<()> {
    let mut h = harness()?;
    h.manager.handle_event(ConnectorEvent::Created(connector("memory", vec![]))).await;
    let old = connector("memory", vec![]);
    let new = connector("memory", vec![var("workers", "many")]);
    h.manager.handle_event(ConnectorEvent::Updated { old, new }).await;

    assert_eq!(h.manager.active_generation(), None, "expected no active generation");
    assert_eq!(h.broker.subscriptions().len(), 1, "expected no new subscription to be opened");
    Ok(())
}

#[tokio::test]
async fn secret_config_vars_are_resolved() -> Result<()> {
    let mut h = harness()?;
    let secret_var = ConfigVar {
        name: "topic".into(),
        value: None,
        secret_key_ref: Some(SecretKeyRef {
            name: "creds".into(),
            key: "topic".into(),
        }),
    };
    h.manager.handle_event(ConnectorEvent::Created(connector("memory", vec![secret_var.clone()]))).await;
    assert_eq!(h.manager.active_generation(), None, "expected an unresolvable secret to fail the generation");

    h.control.add_secret("default", "creds", "topic", "clicks");
    h.manager.handle_event(ConnectorEvent::Created(connector("memory", vec![secret_var]))).await;
    assert_eq!(h.manager.active_generation(), Some(1), "expected generation 1 to be active");
    Ok(())
}

#[tokio::test]
async fn shutdown_retires_the_active_generation() -> Result<()> {
    let h = harness()?;
    let (broker, events_tx, shutdown_tx) = (h.broker.clone(), h.events_tx.clone(), h.shutdown_tx.clone());
    let handle = h.manager.spawn();

    events_tx.send(ConnectorEvent::Created(connector("memory", vec![]))).await?;
    wait_until("subscription to be opened", || broker.latest().is_some()).await?;
    shutdown_tx.send(())?;
    handle.await??;

    let sub = broker.latest().context("expected a subscription to be opened")?;
    assert!(sub.is_closed(), "expected the subscription to be shut down");
    Ok(())
}

#[tokio::test]
async fn hung_workers_are_aborted_after_the_grace_period() -> Result<()> {
    let h = harness()?;
    h.runtime.hang("clicks.default");
    let mut manager = h.manager.with_retire_grace(Duration::from_millis(100));
    manager.handle_event(ConnectorEvent::Created(connector("memory", vec![]))).await;

    let sub = h.broker.latest().context("expected a subscription to be opened")?;
    sub.push("m1", r#"{"user_id":"42"}"#);
    wait_until("execution to start", || !h.runtime.executions().is_empty()).await?;

    let deleted = manager.handle_event(ConnectorEvent::Deleted(connector("memory", vec![])));
    tokio::time::timeout(Duration::from_secs(2), deleted)
        .await
        .context("expected retirement to finish despite a hung worker")?;
    assert_eq!(manager.active_generation(), None, "expected no active generation");
    assert!(sub.is_closed(), "expected the subscription to be shut down");
    assert!(sub.acked().is_empty(), "expected the in-flight message to stay unacked, got {:?}", sub.acked());
    Ok(())
}
