use thiserror::Error;

/// Application-wide error types for the retriever.
///
/// Two families live here. Configuration and filter errors are fatal and
/// abort a run. Transport errors (`HttpStatus`, `HttpError`, `NetworkError`,
/// `Timeout`) are caught at the entity boundary and only drop that entity.
/// A soft miss while filtering is not an error at all: it is represented as
/// [`OutputValue::Missing`](crate::value::OutputValue::Missing).
#[derive(Error, Debug)]
pub enum AppError {
    /// Invalid or incomplete entity configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A filter path was applied in a way the filter language does not allow.
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// The server answered with a non-success status code.
    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    /// HTTP request failed (building the request or reading the body).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Reading or writing delimited text failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Returns true if this error comes from the HTTP layer and should only
    /// drop the entity that triggered it.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AppError::HttpStatus { .. }
                | AppError::HttpError(_)
                | AppError::NetworkError(_)
                | AppError::Timeout(_)
        )
    }

    /// Shorthand used by the configuration layer.
    pub(crate) fn config(message: impl Into<String>) -> Self {
        AppError::ConfigError(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors() {
        assert!(
            AppError::HttpStatus {
                status: 404,
                url: "https://example.com".into(),
            }
            .is_transport()
        );
        assert!(AppError::NetworkError("reset".into()).is_transport());
        assert!(AppError::Timeout(30).is_transport());
        assert!(AppError::HttpError("bad body".into()).is_transport());
    }

    #[test]
    fn test_fatal_errors_are_not_transport() {
        assert!(!AppError::ConfigError("missing name".into()).is_transport());
        assert!(!AppError::InvalidFilter("* misplaced".into()).is_transport());
    }

    #[test]
    fn test_status_display() {
        let err = AppError::HttpStatus {
            status: 503,
            url: "https://api.example.com/x".into(),
        };
        assert_eq!(err.to_string(), "HTTP 503 for https://api.example.com/x");
    }
}
