//! Runtime configuration.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,
    /// Emit structured JSON logs instead of human readable ones.
    #[serde(default = "Config::default_production")]
    pub production: bool,

    /// The name of the DataConnector resource this runner consumes for.
    #[serde(default)]
    pub data_connector_resource: String,
    /// The namespace of the DataConnector resource.
    #[serde(default)]
    pub data_connector_namespace: String,
    /// The name of the pod on which this instance is running.
    #[serde(default)]
    pub pod_name: String,

    /// The address of the program runtime's gRPC API.
    #[serde(default = "Config::default_runtime_grpc_addr")]
    pub runtime_grpc_addr: String,
    /// The address of the core engine's gRPC API.
    #[serde(default = "Config::default_core_grpc_addr")]
    pub core_grpc_addr: String,
    /// The timeout in seconds of each request to the runtime and the core engine.
    #[serde(default = "Config::default_grpc_timeout_secs")]
    pub grpc_timeout_secs: u64,
    /// The time in seconds a retired generation's workers have to exit before being aborted.
    #[serde(default = "Config::default_retire_grace_secs")]
    pub retire_grace_secs: u64,
    /// The port of the metrics server.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Ensure the watched connector is identified.
    pub fn validate(&self) -> Result<()> {
        if self.data_connector_resource.is_empty() || self.data_connector_namespace.is_empty() {
            bail!("DATA_CONNECTOR_RESOURCE and DATA_CONNECTOR_NAMESPACE are required");
        }
        if self.grpc_timeout_secs == 0 {
            bail!("GRPC_TIMEOUT_SECS must be greater than 0");
        }
        Ok(())
    }

    /// The timeout of each downstream gRPC request.
    pub fn grpc_timeout(&self) -> Duration {
        Duration::from_secs(self.grpc_timeout_secs)
    }

    /// The grace period of a retired generation's workers.
    pub fn retire_grace(&self) -> Duration {
        Duration::from_secs(self.retire_grace_secs)
    }

    fn default_rust_log() -> String {
        "info".into()
    }

    fn default_production() -> bool {
        true
    }

    fn default_runtime_grpc_addr() -> String {
        "http://localhost:60005".into()
    }

    fn default_core_grpc_addr() -> String {
        "http://raptor-core-service.raptor-system:60000".into()
    }

    fn default_grpc_timeout_secs() -> u64 {
        10
    }

    fn default_retire_grace_secs() -> u64 {
        30
    }

    fn default_metrics_port() -> u16 {
        9090
    }
}
