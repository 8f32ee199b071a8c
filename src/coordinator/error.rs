//! Error vocabulary of the coordinator

use axum::http::StatusCode;
use thiserror::Error;

use super::types::{HolderId, LockMode, ResourceId};
use crate::error::{ErrorCategory, MarkgateError};

/// Result type for coordinator operations
pub type LockResult<T> = Result<T, LockError>;

/// Errors returned by coordinator operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Malformed resource identifier
    #[error("Invalid resource id: {0:?}")]
    InvalidResource(String),

    /// Malformed holder identifier
    #[error("Invalid holder id: {0:?}")]
    InvalidHolder(String),

    /// Release or heartbeat by someone who does not hold the resource
    #[error("{holder} does not hold {resource}")]
    NotHolder { resource: ResourceId, holder: HolderId },

    /// Resource occupied incompatibly
    #[error("{resource} is busy ({mode} held)")]
    LockBusy { resource: ResourceId, mode: LockMode },

    /// The holder was already evicted; it must acquire again
    #[error("Lease of {holder} on {resource} has expired")]
    LeaseExpired { resource: ResourceId, holder: HolderId },
}

impl LockError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidResource(_) => "invalid_resource",
            Self::InvalidHolder(_) => "invalid_holder",
            Self::NotHolder { .. } => "not_holder",
            Self::LockBusy { .. } => "lock_busy",
            Self::LeaseExpired { .. } => "lease_expired",
        }
    }

    /// HTTP status for external callers; every kind is 4xx so a busy resource is
    /// never confused with a server failure
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidResource(_) | Self::InvalidHolder(_) => StatusCode::BAD_REQUEST,
            Self::NotHolder { .. } => StatusCode::CONFLICT,
            Self::LockBusy { .. } => StatusCode::LOCKED,
            Self::LeaseExpired { .. } => StatusCode::GONE,
        }
    }
}

impl MarkgateError for LockError {
    fn is_recoverable(&self) -> bool {
        matches!(self, Self::LockBusy { .. } | Self::LeaseExpired { .. })
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidResource(_) | Self::InvalidHolder(_) => ErrorCategory::Validation,
            Self::NotHolder { .. } | Self::LockBusy { .. } | Self::LeaseExpired { .. } => {
                ErrorCategory::Coordination
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (ResourceId, HolderId) {
        (
            ResourceId::parse("exam:1:results").unwrap(),
            HolderId::parse("student-7").unwrap(),
        )
    }

    #[test]
    fn test_recoverable_kinds() {
        let (resource, holder) = ids();
        assert!(LockError::LockBusy {
            resource: resource.clone(),
            mode: LockMode::Write
        }
        .is_recoverable());
        assert!(LockError::LeaseExpired {
            resource: resource.clone(),
            holder: holder.clone()
        }
        .is_recoverable());
        assert!(!LockError::NotHolder { resource, holder }.is_recoverable());
        assert!(!LockError::InvalidResource("x y".into()).is_recoverable());
    }

    #[test]
    fn test_busy_is_client_error() {
        let (resource, _) = ids();
        let err = LockError::LockBusy {
            resource,
            mode: LockMode::Write,
        };
        assert_eq!(err.status_code(), StatusCode::LOCKED);
        assert!(err.status_code().is_client_error());
        assert_eq!(err.code(), "lock_busy");
    }

    #[test]
    fn test_display() {
        let (resource, holder) = ids();
        let err = LockError::NotHolder { resource, holder };
        assert_eq!(err.to_string(), "student-7 does not hold exam:1:results");
        assert_eq!(err.category(), ErrorCategory::Coordination);
    }
}
