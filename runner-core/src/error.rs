//! Runner error abstractions.

use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The connector's configuration could not be parsed into its typed form.
    #[error("invalid connector config: {0}")]
    InvalidConfig(String),
    /// A referenced resource could not be found.
    #[error("resource {0} was not found")]
    ResourceNotFound(String),
}
