//! Feature program catalog.
//!
//! A catalog holds the feature programs of one connector generation. It is built once from the
//! connector's feature references and is read-only afterwards.


use std::sync::Arc;

use anyhow::{bail, Context, Result};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::control::ControlPlane;
use crate::runtime::{Execution, ProgramSpec, Runtime, RuntimeError};
use crate::schema::{BoundSchema, ConnectorSchema, SchemaRegistry};
use crate::utils::{Keys, Row};
use runner_core::crd::{Feature, ResourceReference};

/// The maximum number of execution attempts of a program per message.
pub const MAX_EXECUTION_ATTEMPTS: usize = 3;

const METRIC_FEATURES_LOADED: &str = "runner_features_loaded";
const METRIC_FEATURES_REJECTED: &str = "runner_features_rejected";
const METRIC_PROGRAM_RELOADS: &str = "runner_program_reloads";

/// A feature program bound to a connector generation.
#[derive(Debug)]
pub struct FeatureProgram {
    /// The fully qualified name of the feature.
    pub fqn: String,
    /// The row fields identifying the entity the feature is computed for.
    pub keys: Vec<String>,
    /// The schema of the messages this feature consumes. Bodies are parsed as JSON when absent.
    pub schema: Option<BoundSchema>,
    spec: ProgramSpec,
    /// The runtime's ID of the loaded program, replaced when the program is reloaded.
    program_id: RwLock<String>,
}

impl FeatureProgram {
    /// The runtime's current ID of this program.
    pub async fn program_id(&self) -> String {
        self.program_id.read().await.clone()
    }
}

/// The set of feature programs of a connector generation.
pub struct FeatureCatalog {
    runtime: Arc<dyn Runtime>,
    programs: Vec<Arc<FeatureProgram>>,
}

impl FeatureCatalog {
    /// Create a catalog of the given programs.
    pub fn new(runtime: Arc<dyn Runtime>, programs: Vec<Arc<FeatureProgram>>) -> Self {
        Self { runtime, programs }
    }

    /// Build the catalog of the given feature references.
    ///
    /// Features which fail to load are logged and skipped, so the catalog holds whichever subset
    /// loaded successfully, possibly none.
    pub async fn build(
        refs: &[ResourceReference], namespace: &str, default_schema: Option<&ConnectorSchema>, control: &dyn ControlPlane, schemas: &SchemaRegistry,
        runtime: Arc<dyn Runtime>,
    ) -> Self {
        metrics::register_counter!(METRIC_FEATURES_LOADED, metrics::Unit::Count, "feature programs loaded");
        metrics::register_counter!(METRIC_FEATURES_REJECTED, metrics::Unit::Count, "feature programs rejected while loading");
        metrics::register_counter!(METRIC_PROGRAM_RELOADS, metrics::Unit::Count, "feature programs reloaded after a runtime cache miss");

        tracing::info!(count = refs.len(), "fetching feature definitions");
        let mut programs = Vec::with_capacity(refs.len());
        for reference in refs {
            let reference = reference.in_namespace(namespace);
            match load_feature(&reference, default_schema, control, schemas, runtime.as_ref()).await {
                Ok(program) => {
                    tracing::debug!(fqn = %program.fqn, "feature program loaded");
                    metrics::increment_counter!(METRIC_FEATURES_LOADED);
                    programs.push(Arc::new(program));
                }
                Err(err) => {
                    tracing::error!(error = ?err, feature = %reference, "failed to load feature, skipping");
                    metrics::increment_counter!(METRIC_FEATURES_REJECTED);
                }
            }
        }
        Self::new(runtime, programs)
    }

    /// All programs of this catalog.
    pub fn programs(&self) -> &[Arc<FeatureProgram>] {
        &self.programs
    }

    /// Execute the given program.
    ///
    /// A program missing from the runtime is reloaded once and the execution retried, up to
    /// `MAX_EXECUTION_ATTEMPTS` attempts in total. Other errors are returned as is.
    pub async fn execute(&self, program: &FeatureProgram, keys: &Keys, row: &Row, ts: OffsetDateTime) -> Result<Execution, RuntimeError> {
        let mut reloaded = false;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let program_id = program.program_id().await;
            let err = match self.runtime.execute_program(&program_id, &program.fqn, keys, row, ts).await {
                Ok(execution) => return Ok(execution),
                Err(RuntimeError::NotFound(id)) if attempt < MAX_EXECUTION_ATTEMPTS => id,
                Err(err) => return Err(err),
            };
            tracing::debug!(fqn = %program.fqn, program_id = %err, attempt, "program not found in runtime");
            if !reloaded {
                let id = self.runtime.load_program(&program.spec).await?;
                *program.program_id.write().await = id;
                metrics::increment_counter!(METRIC_PROGRAM_RELOADS);
                reloaded = true;
            }
        }
    }
}

/// Fetch, validate and load a single feature.
async fn load_feature(
    reference: &ResourceReference, default_schema: Option<&ConnectorSchema>, control: &dyn ControlPlane, schemas: &SchemaRegistry, runtime: &dyn Runtime,
) -> Result<FeatureProgram> {
    let feature: Feature = control.get_feature(reference).await.context("failed to fetch feature definition")?;
    if !feature.is_streaming() {
        bail!("feature definition kind is not supported: {}", feature.spec.builder.kind);
    }

    let schema = match feature.spec.builder.schema.as_deref().filter(|val| !val.trim().is_empty()) {
        Some(reference) => Some(schemas.bind(reference, default_schema).await.context("failed to bind feature schema")?),
        None => default_schema.and_then(ConnectorSchema::bound),
    };

    let fqn = feature.fqn();
    let spec = ProgramSpec {
        runtime: feature.spec.builder.runtime.clone(),
        fqn: fqn.clone(),
        code: feature.spec.builder.code.clone(),
        packages: feature.spec.builder.packages.clone(),
    };
    let program_id = runtime.load_program(&spec).await.context("failed to load feature program")?;
    Ok(FeatureProgram {
        fqn,
        keys: feature.spec.keys.clone(),
        schema,
        spec,
        program_id: RwLock::new(program_id),
    })
}

#[cfg(test)]
impl FeatureProgram {
    /// Create a program which is already loaded under the given ID.
    pub fn new_test(fqn: &str, keys: &[&str], program_id: &str) -> Self {
        Self {
            fqn: fqn.into(),
            keys: keys.iter().map(|key| key.to_string()).collect(),
            schema: None,
            spec: ProgramSpec {
                fqn: fqn.into(),
                code: format!("def {}(row): return row", fqn.replace('.', "_")),
                ..Default::default()
            },
            program_id: RwLock::new(program_id.into()),
        }
    }
}
