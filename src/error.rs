//! Unified error handling for the markgate crate
//!
//! Domain errors stay precise where they are produced ([`LockError`] in the
//! coordinator, [`ClientError`] in the HTTP client); [`Error`] wraps them when
//! they cross module boundaries, such as in the CLI.
//!
//! # Architecture
//!
//! - [`MarkgateError`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use markgate::error::{Error, MarkgateError};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         println!("Retrying: {err}");
//!     } else {
//!         eprintln!("Fatal error: {err}");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::coordinator::client::ClientError;
pub use crate::coordinator::config::ConfigError;
pub use crate::coordinator::error::LockError;

/// Common trait for all markgate error types
pub trait MarkgateError: std::error::Error {
    /// Check if this error is recoverable (the caller may retry or re-acquire)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Lock conflicts, lost leases, wrong holder
    Coordination,
    /// Malformed identifiers or requests
    Validation,
    /// HTTP and connectivity errors
    Network,
    /// Configuration errors
    Config,
    /// File and socket I/O
    Io,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordination => "coordination",
            Self::Validation => "validation",
            Self::Network => "network",
            Self::Config => "config",
            Self::Io => "io",
            Self::Other => "other",
        }
    }
}

/// Unified error type for the markgate crate
#[derive(Error, Debug)]
pub enum Error {
    /// Lock coordination errors
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Coordinator client errors
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    /// Invalid coordinator configuration
    #[error("Config error: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl MarkgateError for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Lock(e) => e.is_recoverable(),
            Self::Client(e) => e.is_recoverable(),
            Self::Io(_) => true, // sockets drop and come back
            Self::InvalidConfig(_) | Self::Json(_) | Self::Toml(_) | Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Lock(e) => e.category(),
            Self::Client(e) => e.category(),
            Self::InvalidConfig(_) | Self::Toml(_) | Self::Config(_) => ErrorCategory::Config,
            Self::Io(_) => ErrorCategory::Io,
            Self::Json(_) => ErrorCategory::Validation,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: format!("{err:#}"),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::types::{LockMode, ResourceId};

    #[test]
    fn test_lock_error_conversion() {
        let lock_err = LockError::LockBusy {
            resource: ResourceId::parse("exam:1:results").unwrap(),
            mode: LockMode::Write,
        };
        let unified: Error = lock_err.into();
        assert!(matches!(unified, Error::Lock(_)));
        assert_eq!(unified.category(), ErrorCategory::Coordination);
        assert!(unified.is_recoverable());
    }

    #[test]
    fn test_validation_category() {
        let err: Error = LockError::InvalidHolder(String::new()).into();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("max_lease_ms below min_lease_ms");
        assert_eq!(err.category(), ErrorCategory::Config);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_other_error() {
        let err = Error::other("Something went wrong");
        assert_eq!(err.category(), ErrorCategory::Other);
        assert_eq!(err.category().as_str(), "other");
    }

    #[test]
    fn test_with_source_keeps_chain() {
        use std::error::Error as _;

        let io = io::Error::new(io::ErrorKind::AddrInUse, "port taken");
        let err = Error::with_source("Failed to bind", io);
        assert_eq!(err.to_string(), "Failed to bind");
        assert!(err.source().is_some());
    }
}
