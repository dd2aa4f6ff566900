//! Runner error abstractions.

/// An error raised while processing a single message.
///
/// These are isolated to one feature, or to the whole message when raised before any feature
/// could be attempted.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The message body could not be decoded into a row.
    #[error("error decoding message body: {0}")]
    Decode(String),
    /// A required key field is absent from the decoded row.
    #[error("key {0} is missing in the message")]
    MissingKey(String),
    /// The feature program produced a value without an entity ID.
    #[error("feature program returned no entity id")]
    MissingEntityId,
}
