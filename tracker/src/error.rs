//! Error types for the DbListener tracker.
//!
//! Each concern owns its error enum next to the code that raises it; this
//! module folds them into [`TrackerError`], the crate-wide error returned at
//! the public boundary.

use thiserror::Error;

use crate::config::ConfigError;
use crate::extractor::ExtractionError;
use crate::sampler::SamplerError;
use crate::session::SessionError;
use crate::store::StoreError;

/// Errors that can occur during tracker operations.
///
/// # Examples
///
/// ```ignore
/// use dblistener_tracker::error::TrackerError;
///
/// fn open() -> Result<(), TrackerError> {
///     let store = Store::open(path)?;
///     let connections = store.list_connections()?;
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The target database could not be reached for sampling.
    #[error("connectivity error: {0}")]
    Connectivity(#[from] SamplerError),

    /// The report store rejected a read or write.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A single query could not be analyzed.
    #[error("extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    /// The tracking session was driven out of order.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_missing_value_display() {
        let err = ConfigError::InvalidValue {
            key: "DBLISTENER_EXTRACTOR".to_string(),
            message: "expected 'ast' or 'lexical'".to_string(),
        };
        let err: TrackerError = err.into();
        assert_eq!(
            err.to_string(),
            "configuration error: invalid value for DBLISTENER_EXTRACTOR: expected 'ast' or 'lexical'"
        );
    }

    #[test]
    fn sampler_error_maps_to_connectivity() {
        let err: TrackerError = SamplerError::Unreachable("connection refused".to_string()).into();
        assert!(matches!(err, TrackerError::Connectivity(_)));
        assert_eq!(
            err.to_string(),
            "connectivity error: database unreachable: connection refused"
        );
    }

    #[test]
    fn session_error_display() {
        let err: TrackerError = SessionError::AlreadyStarted.into();
        assert_eq!(
            err.to_string(),
            "session error: session has already been started"
        );
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TrackerError = io_err.into();
        assert!(matches!(err, TrackerError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ invalid json }").unwrap_err();
        let err: TrackerError = json_err.into();
        assert!(matches!(err, TrackerError::Json(_)));
    }

    #[test]
    fn error_source_chain() {
        use std::error::Error;

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: TrackerError = io_err.into();
        assert!(err.source().is_some());
    }

    #[test]
    fn result_type_alias_works() {
        fn failing() -> Result<i32> {
            Err(SessionError::NotStarted.into())
        }

        assert!(failing().is_err());
    }
}
