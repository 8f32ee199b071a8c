//! Identifiers, modes and snapshots shared by the coordinator components

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::LockError;

/// Maximum length of a resource or holder identifier
pub const MAX_ID_LEN: usize = 128;

fn is_valid_id(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_ID_LEN
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/'))
}

// ============================================================================
// Identifiers
// ============================================================================

/// Identifies a lockable unit, e.g. one exam's result set or one shard of it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Validate and wrap an externally assigned resource id
    pub fn parse(raw: impl Into<String>) -> Result<Self, LockError> {
        let raw = raw.into();
        if is_valid_id(&raw) {
            Ok(Self(raw))
        } else {
            Err(LockError::InvalidResource(raw))
        }
    }

    /// Resource id for an exam's whole result set
    pub fn exam_results(exam_id: &str) -> Result<Self, LockError> {
        Self::parse(format!("exam:{exam_id}:results"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a (prospective) lock holder, typically one browser session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(String);

impl HolderId {
    /// Validate and wrap a holder id
    pub fn parse(raw: impl Into<String>) -> Result<Self, LockError> {
        let raw = raw.into();
        if is_valid_id(&raw) {
            Ok(Self(raw))
        } else {
            Err(LockError::InvalidHolder(raw))
        }
    }

    /// Fresh random holder id for a new session
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Modes
// ============================================================================

/// Current mode of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockMode {
    /// Nobody holds the resource
    Free,
    /// One or more readers hold the resource
    Read,
    /// Exactly one writer holds the resource
    Write,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Read => "READ",
            Self::Write => "WRITE",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<AccessMode> for LockMode {
    fn from(mode: AccessMode) -> Self {
        match mode {
            AccessMode::Read => Self::Read,
            AccessMode::Write => Self::Write,
        }
    }
}

/// Mode a caller asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
        }
    }

    /// Lowercase label used for metrics and URL segments
    pub fn label(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" | "r" => Ok(Self::Read),
            "write" | "w" => Ok(Self::Write),
            other => Err(format!("unknown access mode '{other}', expected read or write")),
        }
    }
}

// ============================================================================
// Operation outcomes
// ============================================================================

/// Outcome of an `acquire_*` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// The caller now holds the resource
    Granted,
    /// The caller was queued; position is 1-based
    Pending {
        queue_position: usize,
        /// Mode of the resource at the time the request was queued
        blocked_by: LockMode,
    },
}

impl Acquisition {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }

    pub fn queue_position(&self) -> Option<usize> {
        match self {
            Self::Granted => None,
            Self::Pending { queue_position, .. } => Some(*queue_position),
        }
    }
}

/// Read-only view of one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub resource_id: ResourceId,
    pub mode: LockMode,
    pub reader_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writer_id: Option<HolderId>,
    pub queue_length: usize,
}

impl StatusSnapshot {
    /// Snapshot of a resource nobody has touched yet
    pub fn free(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            mode: LockMode::Free,
            reader_count: 0,
            writer_id: None,
            queue_length: 0,
        }
    }
}

/// Where a given holder stands on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum HolderState {
    Reading,
    Writing,
    #[serde(rename_all = "camelCase")]
    Queued {
        position: usize,
        mode: AccessMode,
    },
    Absent,
}

/// Acknowledgement of a successful heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAck {
    /// Milliseconds until the renewed lease lapses
    pub expires_in_ms: u64,
}
