//! Downstream collaborators: the feature program runtime and the feature store.

mod proto;

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use time::OffsetDateTime;
use tonic::transport::{Channel, Endpoint};
use uuid::Uuid;

use crate::utils::{Keys, Row};
use proto::engine_service_client::EngineServiceClient;
use proto::runtime_service_client::RuntimeServiceClient;

/// An error from the program runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The program is not known to the runtime, e.g. because it was evicted from its cache.
    #[error("program {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A feature program to be loaded into the runtime.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProgramSpec {
    /// The runtime environment of the program.
    pub runtime: Option<String>,
    pub fqn: String,
    pub code: String,
    pub packages: Vec<String>,
}

/// The outcome of a program execution.
#[derive(Clone, Debug, PartialEq)]
pub struct Execution {
    /// The value produced by the program, if any.
    pub value: Option<Value>,
    pub timestamp: OffsetDateTime,
    pub entity_id: String,
}

/// The feature program runtime.
#[async_trait::async_trait]
pub trait Runtime: Send + Sync {
    /// Load the given program, returning its program ID.
    async fn load_program(&self, spec: &ProgramSpec) -> Result<String, RuntimeError>;

    /// Execute a loaded program against the given row.
    async fn execute_program(&self, program_id: &str, fqn: &str, keys: &Keys, row: &Row, ts: OffsetDateTime) -> Result<Execution, RuntimeError>;
}

/// The downstream feature store.
#[async_trait::async_trait]
pub trait FeatureStore: Send + Sync {
    /// Update the value of a feature for an entity.
    async fn update(&self, fqn: &str, entity_id: &str, value: &Value, ts: OffsetDateTime) -> Result<()>;
}

/// Create a lazily connecting channel to the given address, bounding every request by `timeout`.
fn channel(addr: &str, timeout: Duration) -> Result<Channel> {
    Ok(Endpoint::from_shared(addr.to_string())
        .with_context(|| format!("invalid gRPC address {}", addr))?
        .timeout(timeout)
        .connect_lazy())
}

fn to_nanos(ts: OffsetDateTime) -> i64 {
    i64::try_from(ts.unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

fn from_nanos(nanos: i64) -> Option<OffsetDateTime> {
    if nanos <= 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos)).ok()
}

/// A runtime reached over gRPC.
#[derive(Clone)]
pub struct GrpcRuntime {
    client: RuntimeServiceClient<Channel>,
}

impl GrpcRuntime {
    /// Create a new instance which connects to the given address on first use.
    pub fn new(addr: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: RuntimeServiceClient::new(channel(addr, timeout)?),
        })
    }
}

#[async_trait::async_trait]
impl Runtime for GrpcRuntime {
    async fn load_program(&self, spec: &ProgramSpec) -> Result<String, RuntimeError> {
        let req = proto::LoadProgramRequest {
            uuid: Uuid::new_v4().to_string(),
            fqn: spec.fqn.clone(),
            program: spec.code.clone(),
            packages: spec.packages.clone(),
            runtime: spec.runtime.clone().unwrap_or_default(),
        };
        let resp = self
            .client
            .clone()
            .load_program(req)
            .await
            .with_context(|| format!("error loading program of feature {}", spec.fqn))?;
        Ok(resp.into_inner().program_id)
    }

    async fn execute_program(&self, program_id: &str, fqn: &str, keys: &Keys, row: &Row, ts: OffsetDateTime) -> Result<Execution, RuntimeError> {
        let req = proto::ExecuteProgramRequest {
            uuid: Uuid::new_v4().to_string(),
            program_id: program_id.to_string(),
            fqn: fqn.to_string(),
            keys: keys.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            data: serde_json::to_vec(row).context("error encoding row")?,
            timestamp: to_nanos(ts),
        };
        let resp = match self.client.clone().execute_program(req).await {
            Ok(resp) => resp.into_inner(),
            Err(status) if status.code() == tonic::Code::NotFound => return Err(RuntimeError::NotFound(program_id.to_string())),
            Err(status) => return Err(anyhow::Error::from(status).context(format!("error executing program of feature {}", fqn)).into()),
        };
        let value = if resp.result.is_empty() {
            None
        } else {
            Some(serde_json::from_slice(&resp.result).context("error decoding program result")?)
        };
        Ok(Execution {
            value,
            timestamp: from_nanos(resp.timestamp).unwrap_or(ts),
            entity_id: resp.entity_id,
        })
    }
}

/// A feature store reached over gRPC through the engine service.
#[derive(Clone)]
pub struct GrpcFeatureStore {
    client: EngineServiceClient<Channel>,
}

impl GrpcFeatureStore {
    /// Create a new instance which connects to the given address on first use.
    pub fn new(addr: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: EngineServiceClient::new(channel(addr, timeout)?),
        })
    }
}

#[async_trait::async_trait]
impl FeatureStore for GrpcFeatureStore {
    async fn update(&self, fqn: &str, entity_id: &str, value: &Value, ts: OffsetDateTime) -> Result<()> {
        let req = proto::UpdateRequest {
            uuid: Uuid::new_v4().to_string(),
            fqn: fqn.to_string(),
            entity_id: entity_id.to_string(),
            value: serde_json::to_vec(value).context("error encoding feature value")?,
            timestamp: to_nanos(ts),
        };
        self.client
            .clone()
            .update(req)
            .await
            .with_context(|| format!("error updating feature {} for entity {}", fqn, entity_id))?;
        Ok(())
    }
}
