//! markgate - read/write lock coordinator for exam marks
//!
//! Students view results (shared reads), teachers enter or correct marks
//! (exclusive writes). Every grant is a lease, so a client that disappears
//! without releasing blocks others for at most its lease duration.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Layered configuration (defaults, TOML, environment)
//! - [`coordinator`] - Lock table, lease monitor, notifier, HTTP API and client
//! - [`error`] - Unified error type and error categories
//! - [`metrics`] - Prometheus metrics
//!
//! # Example
//!
//! ```no_run
//! use markgate::coordinator::MarksCoordinator;
//! use markgate::config::Config;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let coordinator = MarksCoordinator::new(config.to_coordinator_config());
//!
//!     let outcome = coordinator.acquire_write("exam:42:results", "teacher-3", None)?;
//!     assert!(outcome.is_granted());
//!     coordinator.release_write("exam:42:results", "teacher-3")?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::coordinator::{
        AccessMode, Acquisition, CoordinatorConfig, CoordinatorServer, HolderId, LockError,
        LockMode, MarksCoordinator, ResourceId, StatusSnapshot,
    };
    pub use crate::error::{Error, ErrorCategory, MarkgateError, Result};
}

// Direct re-exports for convenience
pub use coordinator::{LockError, LockMode, MarksCoordinator};
