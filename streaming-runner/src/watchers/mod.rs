//! K8s watchers.

mod connector;

pub use connector::{ConnectorTracker, ConnectorWatcher};
