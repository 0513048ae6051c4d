use thiserror::Error;

/// Errors returned by publish and subscribe operations.
///
/// Setup failures (channel open, queue declaration, binding, consumer
/// registration) are returned to the caller. Failures that happen while a
/// subscription is already consuming are never returned; the consumer loop
/// logs them and turns them into an acknowledgment decision.
#[derive(Error, Debug)]
pub enum PubSubError {
    /// Broker connection or channel-level setup failed.
    ///
    /// Covers connecting, opening a channel, applying the prefetch limit,
    /// declaring or binding a queue and registering a consumer.
    #[error("connection error: {0}")]
    Connection(String),

    /// A queue was declared with properties that conflict with an existing
    /// declaration of the same name.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The broker rejected a publish or the channel was closed.
    #[error("publish error: {0}")]
    Publish(String),

    /// A value could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// A payload did not match the expected shape, or carried a content
    /// type the subscription cannot decode.
    #[error("decode error: {0}")]
    Decode(String),

    /// Required configuration field missing.
    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    /// Configuration settings contradict each other.
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),
}

impl PubSubError {
    /// True for conflicting queue declarations.
    pub fn is_configuration(&self) -> bool {
        matches!(self, PubSubError::Configuration(_))
    }
}

/// Result type alias for pub/sub operations
pub type Result<T> = std::result::Result<T, PubSubError>;
