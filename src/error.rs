//! Top-level error types for the timestamper
//!
//! Per-message outcomes never reach this type; see
//! [`Rejection`](crate::relay::envelope::Rejection). Only construction and
//! service wiring fail with a `TimestamperError`.

use crate::config::ConfigError;
use crate::connection::mqtt::MqttError;
use crate::relay::topic::TopicError;
use thiserror::Error;

/// Main error type for timestamper operations
#[derive(Debug, Error)]
pub enum TimestamperError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Invalid topic '{topic}': {source}")]
    InvalidTopic {
        topic: String,
        #[source]
        source: TopicError,
    },

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("MQTT error: {0}")]
    MqttError(#[from] MqttError),

    #[error("Transport error: {0}")]
    TransportError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl TimestamperError {
    /// Create invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create invalid topic error
    pub fn invalid_topic<S: Into<String>>(topic: S, source: TopicError) -> Self {
        Self::InvalidTopic {
            topic: topic.into(),
            source,
        }
    }
}

/// Result type for timestamper operations
pub type TimestamperResult<T> = Result<T, TimestamperError>;
