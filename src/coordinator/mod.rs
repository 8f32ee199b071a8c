//! Marks-resource lock coordinator
//!
//! Serializes access to exam results: students read, teachers write, and a
//! teacher's write never overlaps a student's read of the same exam.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │              Coordinator Server               │
//! │                                               │
//! │  ┌─────────────────────────────────────────┐  │
//! │  │ MarksCoordinator                        │  │
//! │  │  - id validation, lease clamping        │  │
//! │  │  - LockTable (mutex per resource)       │  │
//! │  │  - Notifier (lockAcquired/lockReleased) │  │
//! │  └─────────────────────────────────────────┘  │
//! │                                               │
//! │  ┌─────────────────────────────────────────┐  │
//! │  │ LeaseMonitor                            │  │
//! │  │  - evicts expired holders every tick    │  │
//! │  │  - grants the queue head they blocked   │  │
//! │  └─────────────────────────────────────────┘  │
//! │                                               │
//! │  ┌─────────────────────────────────────────┐  │
//! │  │ REST API                                │  │
//! │  │  GET  /api/locks/{resourceId}           │  │
//! │  │  POST /api/locks/{resourceId}/read      │  │
//! │  │  POST /api/locks/{resourceId}/write     │  │
//! │  │  POST /api/locks/{resourceId}/heartbeat │  │
//! │  │  GET  /api/locks/{resourceId}/events    │  │
//! │  └─────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use markgate::coordinator::{CoordinatorServer, CoordinatorConfig};
//!
//! let config = CoordinatorConfig::default();
//! let server = CoordinatorServer::new(config)?;
//! server.start().await?;
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod lease;
pub mod notifier;
pub mod server;
pub mod service;
pub mod table;
pub mod types;

// Re-export main types
pub use client::{ClientConfig, ClientError, CoordinatorClient, HeartbeatKeeper};
pub use config::{ConfigError, CoordinatorConfig};
pub use error::{LockError, LockResult};
pub use lease::{LeaseMonitor, MonitorHandle};
pub use notifier::{LockEvent, LockNotification, Notifier, Subscription};
pub use server::{AppState, CoordinatorServer, ServerError};
pub use service::{CoordinatorStats, MarksCoordinator, SweepReport};
pub use table::{LockTable, ResourceLock, Transition};
pub use types::{
    AccessMode, Acquisition, HeartbeatAck, HolderId, HolderState, LockMode, ResourceId,
    StatusSnapshot,
};
