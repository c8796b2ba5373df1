//! Error types for queue operations.

use chrono::Duration;
use thiserror::Error;

/// Transport and service level errors raised by providers and links
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message not found or lock expired: {receipt}")]
    MessageNotFound { receipt: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Permission denied for operation: {operation}")]
    PermissionDenied { operation: String },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Batch size {size} exceeds maximum {max_size}")]
    BatchTooLarge { size: usize, max_size: usize },

    #[error("Link to '{queue_name}' is already closed")]
    LinkClosed { queue_name: String },

    #[error("Queue client is already closed")]
    ClientClosed,

    #[error("Failed to write message output: {message}")]
    OutputFailed { message: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl QueueError {
    /// Check if error is transient.
    ///
    /// Nothing in this crate retries; the classification is surfaced in logs
    /// so operators can tell a network blip from a bad credential.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::MessageNotFound { .. } => false,
            Self::Timeout { .. } => true,
            Self::Cancelled { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::PermissionDenied { .. } => false,
            Self::MessageTooLarge { .. } => false,
            Self::BatchTooLarge { .. } => false,
            Self::LinkClosed { .. } => false,
            Self::ClientClosed => false,
            Self::OutputFailed { .. } => false,
            Self::ProviderError { .. } => true,
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }
}

/// Errors during message serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Message body is not valid UTF-8")]
    InvalidUtf8,

    #[error("Header '{name}' is missing or malformed: {message}")]
    InvalidHeader { name: String, message: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Failure of one step of the send/receive flow.
///
/// Every variant records the name of the operation that failed and keeps the
/// underlying [`QueueError`] as its source, so the whole chain can be logged
/// at the top level.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("Failed to build {operation} due to error: {source}")]
    AuthResolution {
        operation: &'static str,
        #[source]
        source: QueueError,
    },

    #[error("Failed to build {operation} due to error: {source}")]
    ClientConstruction {
        operation: &'static str,
        #[source]
        source: QueueError,
    },

    #[error("Failed to build {operation} due to error: {source}")]
    Send {
        operation: &'static str,
        #[source]
        source: QueueError,
    },

    #[error("Failed to build {operation} due to error: {source}")]
    Receive {
        operation: &'static str,
        #[source]
        source: QueueError,
    },
}

impl OperationError {
    /// Name of the operation that failed
    pub fn operation(&self) -> &'static str {
        match self {
            Self::AuthResolution { operation, .. }
            | Self::ClientConstruction { operation, .. }
            | Self::Send { operation, .. }
            | Self::Receive { operation, .. } => operation,
        }
    }

    /// Underlying queue error
    pub fn queue_error(&self) -> &QueueError {
        match self {
            Self::AuthResolution { source, .. }
            | Self::ClientConstruction { source, .. }
            | Self::Send { source, .. }
            | Self::Receive { source, .. } => source,
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
