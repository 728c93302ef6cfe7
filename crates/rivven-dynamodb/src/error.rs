//! Error types for rivven-dynamodb
//!
//! Errors are classified so the retry wrapper can tell transient I/O apart from
//! configuration and data problems, which are never retried.

use thiserror::Error;

/// Result type alias for DynamoDB source operations
pub type Result<T> = std::result::Result<T, DynamoError>;

/// Errors that can occur while syncing a DynamoDB table
#[derive(Debug, Error)]
pub enum DynamoError {
    /// Configuration validation failed
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection to the store or the change log failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Timeout waiting for a response
    #[error("timeout: {0}")]
    Timeout(String),

    /// Request was throttled by the service
    #[error("throttled: {0}")]
    Throttled(String),

    /// Access to a table or stream was denied
    #[error("access denied on table '{table}': {message}")]
    AccessDenied { table: String, message: String },

    /// Table, stream or shard not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Tagged value with an unknown or inconsistent shape
    #[error("malformed attribute value: {0}")]
    Malformed(String),

    /// Number that cannot be represented without rounding
    #[error("invalid decimal '{value}': {reason}")]
    Decimal { value: String, reason: String },

    /// Change stream does not carry new images
    #[error(
        "stream view type for table '{0}' must be NEW_IMAGE or NEW_AND_OLD_IMAGES, \
         record arrived without a new image"
    )]
    StreamView(String),

    /// Checkpoint state is inconsistent
    #[error("state error: {0}")]
    State(String),

    /// Downstream sink rejected a message
    #[error("sink error: {0}")]
    Sink(String),

    /// A table sync failed
    #[error("sync of table '{table}' failed: {source}")]
    Table {
        table: String,
        #[source]
        source: Box<DynamoError>,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl DynamoError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Throttled(_)
        )
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a malformed value error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a sink error
    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    /// Attach the table name at the per-table sync boundary
    pub fn in_table(self, table: impl Into<String>) -> Self {
        match self {
            already @ Self::Table { .. } => already,
            other => Self::Table {
                table: table.into(),
                source: Box::new(other),
            },
        }
    }

    /// Innermost error, looking through table wrappers
    pub fn root(&self) -> &DynamoError {
        match self {
            Self::Table { source, .. } => source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_check() {
        assert!(DynamoError::connection("reset by peer").is_retryable());
        assert!(DynamoError::timeout("read timed out").is_retryable());
        assert!(DynamoError::Throttled("slow down".to_string()).is_retryable());
        assert!(!DynamoError::config("bad alias").is_retryable());
        assert!(!DynamoError::malformed("unknown tag").is_retryable());
        assert!(!DynamoError::StreamView("users".to_string()).is_retryable());
    }

    #[test]
    fn test_table_wrapper_display() {
        let err = DynamoError::config("alias '#cmt' is not defined").in_table("GoogleDocs");
        assert_eq!(
            err.to_string(),
            "sync of table 'GoogleDocs' failed: configuration error: alias '#cmt' is not defined"
        );
        assert!(matches!(err.root(), DynamoError::Config(_)));
    }

    #[test]
    fn test_table_wrapper_not_nested() {
        let err = DynamoError::timeout("scan").in_table("a").in_table("b");
        match err {
            DynamoError::Table { table, .. } => assert_eq!(table, "a"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_wrapped_transient_is_not_retried() {
        let err = DynamoError::timeout("scan").in_table("users");
        assert!(!err.is_retryable());
        assert!(err.root().is_retryable());
    }
}
