pub mod config;
pub mod crd;
pub mod error;

pub use error::AppError;

/// The extraction kind a Feature must declare in order to be bound to a streaming connector.
pub const STREAMING_KIND: &str = "streaming";
