//! Error types for autoforward.

use std::time::Duration;

/// Top-level error type for the forwarder.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
///
/// Raised both for process configuration (environment) and for
/// malformed task settings read from the store.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Malformed replace rule '{rule}': {reason}")]
    MalformedReplaceRule { rule: String, reason: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Channel-related errors (inbound side of the platform connection).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },
}

/// Outbound delivery errors for a single destination.
///
/// The engine treats both variants the same way (log, count as failure,
/// move on); the split exists for logging and for the platform adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("Transient delivery failure to {destination}: {reason}")]
    Transient {
        destination: i64,
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("Permanent delivery failure to {destination}: {reason}")]
    Permanent { destination: i64, reason: String },

    #[error("Media unavailable for {destination}: {source}")]
    MediaUnavailable {
        destination: i64,
        #[source]
        source: MediaError,
    },
}

impl DeliveryError {
    /// Destination chat the failure belongs to.
    pub fn destination(&self) -> i64 {
        match self {
            Self::Transient { destination, .. }
            | Self::Permanent { destination, .. }
            | Self::MediaUnavailable { destination, .. } => *destination,
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::Permanent { .. } => "permanent",
            Self::MediaUnavailable { .. } => "media_unavailable",
        }
    }
}

/// Media retrieval errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MediaError {
    #[error("Media {handle} not found")]
    NotFound { handle: String },

    #[error("Media download failed for {handle}: {reason}")]
    DownloadFailed { handle: String, reason: String },

    #[error("Media {handle} too large: {size} bytes")]
    TooLarge { handle: String, size: u64 },
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid message link: {0}")]
    InvalidLink(String),

    #[error("Batch failed: {0}")]
    Batch(String),
}

/// Result type alias for the forwarder.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_error_exposes_destination() {
        let err = DeliveryError::Transient {
            destination: -100123,
            reason: "timeout".into(),
            retry_after: None,
        };
        assert_eq!(err.destination(), -100123);
        assert_eq!(err.label(), "transient");

        let err = DeliveryError::MediaUnavailable {
            destination: 42,
            source: MediaError::NotFound {
                handle: "abc".into(),
            },
        };
        assert_eq!(err.destination(), 42);
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn component_errors_convert_into_top_level() {
        let err: Error = DatabaseError::Query("locked".into()).into();
        assert!(matches!(err, Error::Database(_)));
        assert!(err.to_string().contains("locked"));

        let err: Error = PipelineError::InvalidLink("https://t.me/x".into()).into();
        assert!(err.to_string().contains("https://t.me/x"));
    }
}
