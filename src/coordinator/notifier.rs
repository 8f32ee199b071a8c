//! Lock-state notifications
//!
//! Delivery is best-effort and at most once per transition. Subscribers that fall
//! behind skip the missed events and must re-poll `status`; nothing a subscriber
//! does can affect the lock table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use super::table::Transition;
use super::types::{HolderId, LockMode, ResourceId};

/// Event published on a lock-state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    /// A resource became held, or queued requests were granted
    LockAcquired {
        resource_id: ResourceId,
        mode: LockMode,
        /// Holders granted by this transition; never sent to subscribers verbatim
        grantees: Vec<HolderId>,
    },
    /// A held resource became free
    LockReleased { resource_id: ResourceId, mode: LockMode },
}

impl LockEvent {
    pub fn from_transition(resource_id: &ResourceId, transition: Transition) -> Self {
        match transition {
            Transition::Acquired { mode, grantees } => Self::LockAcquired {
                resource_id: resource_id.clone(),
                mode,
                grantees,
            },
            Transition::Released { mode } => Self::LockReleased {
                resource_id: resource_id.clone(),
                mode,
            },
        }
    }

    pub fn resource_id(&self) -> &ResourceId {
        match self {
            Self::LockAcquired { resource_id, .. } | Self::LockReleased { resource_id, .. } => resource_id,
        }
    }

    pub fn mode(&self) -> LockMode {
        match self {
            Self::LockAcquired { mode, .. } | Self::LockReleased { mode, .. } => *mode,
        }
    }

    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::LockAcquired { .. } => "lockAcquired",
            Self::LockReleased { .. } => "lockReleased",
        }
    }

    /// External payload as seen by one subscriber. Holder identities are reduced to
    /// whether this viewer was among the grantees.
    pub fn to_notification(&self, viewer: Option<&HolderId>) -> LockNotification {
        let granted_to_you = match (self, viewer) {
            (Self::LockAcquired { grantees, .. }, Some(viewer)) => Some(grantees.contains(viewer)),
            _ => None,
        };

        LockNotification {
            event: self.name().to_string(),
            resource_id: self.resource_id().clone(),
            mode: self.mode(),
            granted_to_you,
            at: Utc::now(),
        }
    }
}

/// Serialized notification delivered to dashboards and exam clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockNotification {
    pub event: String,
    pub resource_id: ResourceId,
    pub mode: LockMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted_to_you: Option<bool>,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Notifier
// ============================================================================

/// Fan-out of lock events to any number of subscribers
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<LockEvent>,
}

impl Notifier {
    /// Create a notifier buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; returns how many subscribers it reached
    pub fn publish(&self, event: LockEvent) -> usize {
        tracing::debug!(
            event = event.name(),
            resource = %event.resource_id(),
            mode = %event.mode(),
            "Publishing lock event"
        );
        // No subscribers is not an error
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events for every resource
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter: None,
        }
    }

    /// Subscribe to events for one resource
    pub fn subscribe_to(&self, resource_id: ResourceId) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter: Some(resource_id),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving half handed to one consumer
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<LockEvent>,
    filter: Option<ResourceId>,
}

impl Subscription {
    fn wants(&self, event: &LockEvent) -> bool {
        self.filter.as_ref().map_or(true, |id| event.resource_id() == id)
    }

    /// Wait for the next matching event; `None` once the notifier is gone
    pub async fn recv(&mut self) -> Option<LockEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Lock event subscriber lagged; state must be re-polled");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-buffered matching event, without waiting
    pub fn try_recv(&mut self) -> Option<LockEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Lock event subscriber lagged; state must be re-polled");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}
