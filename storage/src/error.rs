use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use std::fmt;

/// Error type for storage operations
#[derive(Debug)]
pub enum StorageError {
    /// The service could not be reached or answered with a transient failure
    Unavailable(String),
    /// Invalid or incomplete provider configuration
    Configuration(String),
    /// I/O error
    Io(std::io::Error),
    /// Object or bucket not found
    NotFound(String),
    /// Credentials rejected or access denied
    PermissionDenied(String),
    /// Request rejected for a non-transient reason
    Request(String),
    /// Serialization/deserialization error
    Serialization(String),
    /// Unexpected error
    Unexpected(String),
}

impl StorageError {
    /// Classifies an HTTP status returned by a storage service.
    pub fn from_status(status: u16, context: impl Into<String>) -> Self {
        let context = context.into();
        match status {
            401 | 403 => StorageError::PermissionDenied(context),
            404 => StorageError::NotFound(context),
            408 | 429 | 500..=599 => StorageError::Unavailable(context),
            _ => StorageError::Request(context),
        }
    }

    /// Classifies an AWS SDK error by its HTTP status, or by failure kind when
    /// no response was received.
    pub fn from_sdk<E>(err: &SdkError<E, HttpResponse>, context: &str) -> Self
    where
        E: std::error::Error + 'static,
    {
        let message = format!("{context}: {}", DisplayErrorContext(err));
        match err.raw_response().map(|r| r.status().as_u16()) {
            Some(status) => StorageError::from_status(status, message),
            None if matches!(err, SdkError::ConstructionFailure(_)) => {
                StorageError::Configuration(message)
            }
            None => StorageError::Unavailable(message),
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Unavailable(msg) => write!(f, "Storage unavailable: {}", msg),
            StorageError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            StorageError::Io(err) => write!(f, "I/O error: {}", err),
            StorageError::NotFound(msg) => write!(f, "Not found: {}", msg),
            StorageError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            StorageError::Request(msg) => write!(f, "Request error: {}", msg),
            StorageError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            StorageError::Unexpected(msg) => write!(f, "Unexpected error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => StorageError::from_status(status.as_u16(), err.to_string()),
            None if err.is_builder() => StorageError::Configuration(err.to_string()),
            None => StorageError::Unavailable(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
