//! Error types for the lifecycle manager and its builders.

use std::fmt;
use thiserror::Error;

/// Result type used throughout the crate
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Boxed error returned by record handlers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Required builder fields, in the order they are validated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigField {
    BootstrapServers,
    GroupId,
    /// Consumer topic list
    Topics,
    /// Producer destination topic
    Topic,
    KeyCodec,
    ValueCodec,
    Handler,
}

impl ConfigField {
    /// Human readable message for a missing field
    pub fn message(&self) -> &'static str {
        match self {
            Self::BootstrapServers => "Missing bootstrap servers configuration",
            Self::GroupId => "Missing consumer group ID",
            Self::Topics => "No topics specified",
            Self::Topic => "Missing destination topic",
            Self::KeyCodec => "Missing key codec",
            Self::ValueCodec => "Missing value codec",
            Self::Handler => "Missing record handler, define one with listener() or handler()",
        }
    }
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Errors raised by builders, runners and the lifecycle manager
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// A required builder field is missing
    #[error("Configuration error: {field}")]
    Configuration { field: ConfigField },

    /// Plugin settings could not be loaded or are out of range
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// The broker client library refused to create a handle
    #[error("Client error: {message}")]
    Client {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Polling, dispatching or sending failed
    #[error("Delivery error: {message}")]
    Delivery {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// A record could not be decoded
    #[error("Invalid data: {message}")]
    InvalidData { message: String, payload: Vec<u8> },

    /// A value could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The underlying handle is already closed
    #[error("Closed: {0}")]
    Closed(String),
}

impl LifecycleError {
    /// Missing required field
    pub fn missing(field: ConfigField) -> Self {
        Self::Configuration { field }
    }

    /// Invalid plugin settings
    pub fn settings(msg: impl Into<String>) -> Self {
        Self::InvalidSettings(msg.into())
    }

    /// Client creation failure
    pub fn client(msg: impl Into<String>) -> Self {
        Self::Client {
            message: msg.into(),
            source: None,
        }
    }

    /// Client creation failure with source error
    pub fn client_with_source<E>(msg: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Client {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Delivery failure
    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery {
            message: msg.into(),
            source: None,
        }
    }

    /// Delivery failure with source error
    pub fn delivery_with_source<E>(msg: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Delivery {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Delivery failure caused by a handler error
    pub fn handler_failed(source: BoxError) -> Self {
        Self::Delivery {
            message: format!("Record handler failed: {}", source),
            source: Some(source),
        }
    }

    /// Check if this is a builder configuration error
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// The missing field, for configuration errors
    pub fn missing_field(&self) -> Option<ConfigField> {
        match self {
            Self::Configuration { field } => Some(*field),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_names_field() {
        let err = LifecycleError::missing(ConfigField::GroupId);
        assert!(err.is_configuration());
        assert_eq!(err.missing_field(), Some(ConfigField::GroupId));
        assert!(err.to_string().contains("consumer group ID"));
    }

    #[test]
    fn test_field_messages_are_distinct() {
        let fields = [
            ConfigField::BootstrapServers,
            ConfigField::GroupId,
            ConfigField::Topics,
            ConfigField::Topic,
            ConfigField::KeyCodec,
            ConfigField::ValueCodec,
            ConfigField::Handler,
        ];
        let messages: std::collections::HashSet<_> =
            fields.iter().map(|f| f.message()).collect();
        assert_eq!(messages.len(), fields.len());
    }

    #[test]
    fn test_delivery_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "broken pipe");
        let err = LifecycleError::delivery_with_source("send failed", io);
        assert!(!err.is_configuration());
        assert!(err.missing_field().is_none());
        assert!(std::error::Error::source(&err).is_some());
    }
}
