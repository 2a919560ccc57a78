//! # Error Handling
//!
//! Process-level errors for the ingress control plane.
//!
//! Resource validation problems never surface here: they are recorded as
//! per-resource statuses by the graph builder. This type covers static
//! configuration errors (fatal at startup), I/O and decoding failures while
//! loading snapshots, and cancellation of long-lived cache waits.

/// Custom result type for control plane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the control plane
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors with optional field information
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// YAML deserialization errors
    #[error("YAML error: {context}")]
    Yaml {
        #[source]
        source: serde_yaml::Error,
        context: String,
    },

    /// A wait on a snapshot cache was cancelled by its caller
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    /// Create an I/O error with context
    pub fn io<S: Into<String>>(source: std::io::Error, context: S) -> Self {
        Self::Io { source, context: context.into() }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Self::Cancelled(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Whether this error was caused by caller cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { source: error, context: "JSON deserialization failed".to_string() }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(error: serde_yaml::Error) -> Self {
        Self::Yaml { source: error, context: "YAML deserialization failed".to_string() }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut messages: Vec<String> = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| {
                        e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string())
                    })
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect();
        messages.sort();

        // Nested sections report through `errors()`, not `field_errors()`.
        if messages.is_empty() {
            return Self::validation(errors.to_string());
        }
        Self::validation(messages.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let err = Error::config("bad listener port");
        assert_eq!(err.to_string(), "Configuration error: bad listener port");

        let err = Error::validation_field("must be positive", "request_timeout");
        match err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("request_timeout")),
            other => panic!("unexpected error: {:?}", other),
        }

        assert!(Error::cancelled("stream closed").is_cancelled());
        assert!(!Error::internal("boom").is_cancelled());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_error.into();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_error = serde_yaml::from_str::<Vec<u32>>("{ not: a list").unwrap_err();
        let err: Error = yaml_error.into();
        assert!(err.to_string().starts_with("YAML error"));
    }
}
