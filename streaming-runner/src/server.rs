//! HTTP endpoints of the runner.

mod prom;

pub use prom::spawn_metrics_server;
