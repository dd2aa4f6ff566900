//! The streaming runner.
//!
//! Consumes the messages of a DataConnector's broker and feeds them into the feature programs
//! bound to the connector.

mod app;
mod brokers;
mod config;
mod control;
mod error;
mod features;
#[cfg(test)]
mod fixtures;
mod manager;
mod runtime;
mod schema;
mod server;
mod utils;
mod watchers;
mod worker;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Arc::new(Config::new()?);

    // Setup tracing/logging system. Production emits JSON lines, development compact ANSI output.
    let (json_layer, compact_layer) = if cfg.production {
        (Some(tracing_subscriber::fmt::layer().json().with_target(true).with_level(true)), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true)))
    };
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG directives.
        .with(tracing_subscriber::EnvFilter::try_new(&cfg.rust_log).context("error parsing RUST_LOG directives")?)
        .with(json_layer)
        .with(compact_layer)
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let recorder = PrometheusBuilder::new()
        .add_global_label("connector", format!("{}.{}", cfg.data_connector_resource, cfg.data_connector_namespace))
        .add_global_label("pod", cfg.pod_name.clone())
        .build();
    let metrics_handle = recorder.handle();
    metrics::set_boxed_recorder(Box::new(recorder)).context("error setting prometheus metrics recorder")?;

    tracing::info!(
        connector = %cfg.data_connector_resource,
        namespace = %cfg.data_connector_namespace,
        metrics_port = %cfg.metrics_port,
        "starting streaming runner",
    );
    if let Err(err) = App::new(cfg, metrics_handle).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
