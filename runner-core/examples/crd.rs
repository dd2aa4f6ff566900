//! A script used to generate the CRDs used by this project.
//!
//! Any time a CRD spec changes, this script can be run to ensure that the CRDs are up-to-date and
//! ready to be synced with the cluster.

use anyhow::{Context, Result};
use kube::CustomResourceExt;
use runner_core::crd::{DataConnector, Feature};

fn main() -> Result<()> {
    let canon = std::fs::canonicalize("..").context("error getting canonical path of current dir")?;
    let crds_path = canon.join("config").join("crd");
    std::fs::create_dir_all(&crds_path).with_context(|| format!("error creating CRD dir {:?}", &crds_path))?;

    let connector = DataConnector::crd();
    let connector_yaml = serde_yaml::to_string(&connector).context("error serializing DataConnector CRD to yaml")?;
    std::fs::write(crds_path.join("dataconnector.yaml"), &connector_yaml)
        .with_context(|| format!("error writing DataConnector CRD to {:?}", &crds_path))?;
    println!("DataConnector CRD written to {:?}", &crds_path);

    let feature = Feature::crd();
    let feature_yaml = serde_yaml::to_string(&feature).context("error serializing Feature CRD to yaml")?;
    std::fs::write(crds_path.join("feature.yaml"), &feature_yaml).with_context(|| format!("error writing Feature CRD to {:?}", &crds_path))?;
    println!("Feature CRD written to {:?}", &crds_path);

    Ok(())
}
