use std::net::SocketAddr;

use anyhow::Result;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::{extract::Extension, routing::get, AddExtensionLayer, Router};
use futures::prelude::*;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Spawn the HTTP server exposing the Prometheus metrics of the runner and a liveness probe.
pub fn spawn_metrics_server(handle: PrometheusHandle, port: u16, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let app = Router::new()
        .route("/metrics", get(prometheus_scrape))
        .route("/healthz", get(liveness))
        .layer(AddExtensionLayer::new(handle));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server = axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown.recv().await;
        });
    tracing::info!(%addr, "metrics server is listening");
    tokio::spawn(server.map_err(anyhow::Error::from))
}

/// Render the metrics of the global recorder in the Prometheus text format.
async fn prometheus_scrape(Extension(handle): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, handle.render())
}

async fn liveness() -> StatusCode {
    StatusCode::OK
}
