//! Coordinator API: the single entry point for lock operations
//!
//! `MarksCoordinator` validates identifiers, clamps leases, runs each operation
//! inside the resource's critical section and publishes the resulting
//! transitions. All operations are synchronous and never wait for a lock to free
//! up; a blocked acquisition is answered with its queue position instead.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

use super::config::CoordinatorConfig;
use super::error::{LockError, LockResult};
use super::notifier::{LockEvent, Notifier, Subscription};
use super::table::{LockTable, ResourceLock, Transition};
use super::types::{
    AccessMode, Acquisition, HeartbeatAck, HolderId, HolderState, LockMode, ResourceId,
    StatusSnapshot,
};
use crate::metrics;

/// Lifetime counters, reported by `stats()`
#[derive(Debug, Default)]
struct Counters {
    grants: AtomicU64,
    releases: AtomicU64,
    evictions: AtomicU64,
}

/// Totals across the lock table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStats {
    pub resources: usize,
    pub read_held: usize,
    pub write_held: usize,
    pub readers: usize,
    pub queued: usize,
    pub subscribers: usize,
    pub total_grants: u64,
    pub total_releases: u64,
    pub total_evictions: u64,
}

/// Result of one lease monitor pass
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Holders whose lease elapsed
    pub evicted: usize,
    /// Idle resource records removed
    pub pruned: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.evicted == 0 && self.pruned == 0
    }
}

/// Lock coordinator for marks resources
#[derive(Debug)]
pub struct MarksCoordinator {
    config: CoordinatorConfig,
    table: LockTable,
    notifier: Notifier,
    counters: Counters,
}

fn parse_ids(resource_id: &str, holder_id: &str) -> LockResult<(ResourceId, HolderId)> {
    Ok((ResourceId::parse(resource_id)?, HolderId::parse(holder_id)?))
}

impl MarksCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let notifier = Notifier::new(config.event_capacity);
        Self {
            config,
            table: LockTable::new(),
            notifier,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    // ========================================================================
    // Acquisition
    // ========================================================================

    /// Grant shared access now, or queue the request
    pub fn acquire_read(&self, resource_id: &str, holder_id: &str, lease_ms: Option<u64>) -> LockResult<Acquisition> {
        self.acquire(resource_id, holder_id, lease_ms, AccessMode::Read)
    }

    /// Grant exclusive access now, or queue the request
    pub fn acquire_write(&self, resource_id: &str, holder_id: &str, lease_ms: Option<u64>) -> LockResult<Acquisition> {
        self.acquire(resource_id, holder_id, lease_ms, AccessMode::Write)
    }

    fn acquire(&self, resource_id: &str, holder_id: &str, lease_ms: Option<u64>, mode: AccessMode) -> LockResult<Acquisition> {
        let (resource, holder) = parse_ids(resource_id, holder_id)?;
        let lease = self.config.clamp_lease(lease_ms);
        let now = Instant::now();

        let outcome = self.table.with_resource(&resource, |lock| {
            let (outcome, transitions) = match mode {
                AccessMode::Read => lock.acquire_read(&holder, lease, now),
                AccessMode::Write => lock.acquire_write(&holder, lease, now),
            };
            self.publish(lock, transitions, Some(&holder));
            outcome
        });

        match &outcome {
            Acquisition::Granted => {
                self.count_grants(mode, 1);
                tracing::info!(
                    resource = %resource,
                    holder = %holder,
                    mode = mode.label(),
                    lease_ms = lease.as_millis() as u64,
                    "Lock granted"
                );
            }
            Acquisition::Pending { queue_position, blocked_by } => {
                tracing::debug!(
                    resource = %resource,
                    holder = %holder,
                    mode = mode.label(),
                    queue_position,
                    blocked_by = %blocked_by,
                    "Lock request queued"
                );
            }
        }

        Ok(outcome)
    }

    /// Shared access now or `LockBusy`; never queues
    pub fn try_acquire_read(&self, resource_id: &str, holder_id: &str, lease_ms: Option<u64>) -> LockResult<()> {
        self.try_acquire(resource_id, holder_id, lease_ms, AccessMode::Read)
    }

    /// Exclusive access now or `LockBusy`; never queues
    pub fn try_acquire_write(&self, resource_id: &str, holder_id: &str, lease_ms: Option<u64>) -> LockResult<()> {
        self.try_acquire(resource_id, holder_id, lease_ms, AccessMode::Write)
    }

    fn try_acquire(&self, resource_id: &str, holder_id: &str, lease_ms: Option<u64>, mode: AccessMode) -> LockResult<()> {
        let (resource, holder) = parse_ids(resource_id, holder_id)?;
        let lease = self.config.clamp_lease(lease_ms);
        let now = Instant::now();

        let result = self.table.with_resource(&resource, |lock| -> LockResult<()> {
            let transitions = match mode {
                AccessMode::Read => lock.try_acquire_read(&holder, lease, now)?,
                AccessMode::Write => lock.try_acquire_write(&holder, lease, now)?,
            };
            self.publish(lock, transitions, Some(&holder));
            Ok(())
        });

        match &result {
            Ok(()) => {
                self.count_grants(mode, 1);
                tracing::info!(resource = %resource, holder = %holder, mode = mode.label(), "Lock granted");
            }
            Err(e) => {
                metrics::record_busy();
                tracing::debug!(resource = %resource, holder = %holder, error = %e, "Try-acquire refused");
            }
        }
        result
    }

    // ========================================================================
    // Release
    // ========================================================================

    /// Idempotent; also withdraws a queued read request
    pub fn release_read(&self, resource_id: &str, holder_id: &str) -> LockResult<()> {
        let (resource, holder) = parse_ids(resource_id, holder_id)?;
        let now = Instant::now();

        let released = self
            .table
            .with_existing(&resource, |lock| {
                let held = lock.holder_state(&holder) == HolderState::Reading;
                let transitions = lock.release_read(&holder, now);
                self.publish(lock, transitions, None);
                held
            })
            .unwrap_or(false);

        if released {
            self.count_release(AccessMode::Read);
            tracing::info!(resource = %resource, holder = %holder, "Read lock released");
        }
        Ok(())
    }

    /// Only the current writer may release
    pub fn release_write(&self, resource_id: &str, holder_id: &str) -> LockResult<()> {
        let (resource, holder) = parse_ids(resource_id, holder_id)?;
        let now = Instant::now();

        let result = self
            .table
            .with_existing(&resource, |lock| -> LockResult<bool> {
                let held = lock.holder_state(&holder) == HolderState::Writing;
                let transitions = lock.release_write(&holder, now)?;
                self.publish(lock, transitions, None);
                Ok(held)
            })
            .unwrap_or_else(|| {
                Err(LockError::NotHolder {
                    resource: resource.clone(),
                    holder: holder.clone(),
                })
            });

        match result {
            Ok(true) => {
                self.count_release(AccessMode::Write);
                tracing::info!(resource = %resource, holder = %holder, "Write lock released");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                metrics::record_not_holder();
                tracing::warn!(resource = %resource, holder = %holder, "Write release by non-holder");
                Err(e)
            }
        }
    }

    /// Extend a lease, or keep a queued request alive
    pub fn heartbeat(&self, resource_id: &str, holder_id: &str) -> LockResult<HeartbeatAck> {
        let (resource, holder) = parse_ids(resource_id, holder_id)?;
        let now = Instant::now();

        let result = self
            .table
            .with_existing(&resource, |lock| lock.heartbeat(&holder, now))
            .unwrap_or_else(|| {
                Err(LockError::NotHolder {
                    resource: resource.clone(),
                    holder: holder.clone(),
                })
            });

        match &result {
            Ok(ack) => {
                metrics::record_heartbeat();
                tracing::debug!(resource = %resource, holder = %holder, expires_in_ms = ack.expires_in_ms, "Heartbeat");
            }
            Err(LockError::NotHolder { .. }) => {
                metrics::record_not_holder();
                tracing::warn!(resource = %resource, holder = %holder, "Heartbeat from non-holder");
            }
            Err(e) => {
                tracing::info!(resource = %resource, holder = %holder, error = %e, "Heartbeat rejected");
            }
        }
        result
    }

    /// Withdraw a pending request; returns whether one existed
    pub fn cancel(&self, resource_id: &str, holder_id: &str) -> LockResult<bool> {
        let (resource, holder) = parse_ids(resource_id, holder_id)?;
        let now = Instant::now();

        let removed = self
            .table
            .with_existing(&resource, |lock| {
                let (removed, transitions) = lock.cancel(&holder, now);
                self.publish(lock, transitions, None);
                removed
            })
            .unwrap_or(false);

        if removed {
            tracing::debug!(resource = %resource, holder = %holder, "Pending request cancelled");
        }
        Ok(removed)
    }

    /// Release every hold and pending request of a holder, on every resource
    pub fn disconnect(&self, holder_id: &str) -> LockResult<usize> {
        let holder = HolderId::parse(holder_id)?;
        let now = Instant::now();
        let mut released = 0;

        for slot in self.table.slots() {
            let mut lock = slot.lock();
            let (removed, transitions) = lock.disconnect(&holder, now);
            if removed > 0 {
                tracing::info!(resource = %lock.id(), holder = %holder, removed, "Released on disconnect");
            }
            self.publish(&lock, transitions, None);
            released += removed;
        }

        if released > 0 {
            self.counters.releases.fetch_add(released as u64, Ordering::Relaxed);
        }
        Ok(released)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Snapshot of one resource; an untouched resource is reported free
    pub fn status(&self, resource_id: &str) -> LockResult<StatusSnapshot> {
        let resource = ResourceId::parse(resource_id)?;
        Ok(self
            .table
            .with_existing(&resource, |lock| lock.status())
            .unwrap_or_else(|| StatusSnapshot::free(resource)))
    }

    pub fn holder_state(&self, resource_id: &str, holder_id: &str) -> LockResult<HolderState> {
        let (resource, holder) = parse_ids(resource_id, holder_id)?;
        Ok(self
            .table
            .with_existing(&resource, |lock| lock.holder_state(&holder))
            .unwrap_or(HolderState::Absent))
    }

    pub fn stats(&self) -> CoordinatorStats {
        let mut stats = CoordinatorStats {
            resources: 0,
            read_held: 0,
            write_held: 0,
            readers: 0,
            queued: 0,
            subscribers: self.notifier.subscriber_count(),
            total_grants: self.counters.grants.load(Ordering::Relaxed),
            total_releases: self.counters.releases.load(Ordering::Relaxed),
            total_evictions: self.counters.evictions.load(Ordering::Relaxed),
        };

        for slot in self.table.slots() {
            let lock = slot.lock();
            stats.resources += 1;
            stats.readers += lock.reader_count();
            stats.queued += lock.queue_len();
            match lock.mode() {
                LockMode::Read => stats.read_held += 1,
                LockMode::Write => stats.write_held += 1,
                LockMode::Free => {}
            }
        }
        stats
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    pub fn subscribe(&self) -> Subscription {
        self.notifier.subscribe()
    }

    pub fn subscribe_to(&self, resource_id: &str) -> LockResult<Subscription> {
        Ok(self.notifier.subscribe_to(ResourceId::parse(resource_id)?))
    }

    // ========================================================================
    // Lease expiry
    // ========================================================================

    /// Evict expired holders on every resource, then drop idle records
    pub fn sweep_expired(&self) -> SweepReport {
        let _timer = metrics::start_sweep_timer();
        let now = Instant::now();
        let retention = self.config.tombstone_retention();
        let mut report = SweepReport::default();

        for slot in self.table.slots() {
            let mut lock = slot.lock();
            let outcome = lock.sweep(now, retention);
            if outcome.is_empty() {
                continue;
            }

            for (holder, mode) in &outcome.evicted {
                metrics::record_eviction(mode.label());
                tracing::info!(resource = %lock.id(), holder = %holder, mode = mode.label(), "Lease expired");
            }

            report.evicted += outcome.evicted.len();
            self.publish(&lock, outcome.transitions, None);
        }

        report.pruned = self.table.prune_idle();

        self.counters.evictions.fetch_add(report.evicted as u64, Ordering::Relaxed);

        let stats = self.stats();
        metrics::update_table_metrics(stats.resources, stats.queued, stats.subscribers);

        report
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Publish transitions while the resource is still locked, so subscribers see
    /// them in state order. Queued holders granted by a drain are counted here;
    /// `caller` is counted by its own operation.
    fn publish(&self, lock: &ResourceLock, transitions: Vec<Transition>, caller: Option<&HolderId>) {
        for transition in transitions {
            if let Transition::Acquired { mode, grantees } = &transition {
                let drained = grantees.iter().filter(|g| Some(*g) != caller).count();
                if drained > 0 {
                    let access = match mode {
                        LockMode::Write => AccessMode::Write,
                        _ => AccessMode::Read,
                    };
                    self.count_grants(access, drained);
                    tracing::info!(resource = %lock.id(), mode = %mode, granted = drained, "Queued requests granted");
                }
            }
            self.notifier.publish(LockEvent::from_transition(lock.id(), transition));
        }
    }

    fn count_grants(&self, mode: AccessMode, count: usize) {
        self.counters.grants.fetch_add(count as u64, Ordering::Relaxed);
        metrics::record_grants(mode.label(), count);
    }

    fn count_release(&self, mode: AccessMode) {
        self.counters.releases.fetch_add(1, Ordering::Relaxed);
        metrics::record_release(mode.label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> MarksCoordinator {
        MarksCoordinator::new(CoordinatorConfig::default())
    }

    #[test]
    fn test_invalid_ids_rejected() {
        let c = coordinator();
        assert!(matches!(
            c.acquire_read("", "s1", None),
            Err(LockError::InvalidResource(_))
        ));
        assert!(matches!(
            c.acquire_write("exam:1:results", "bad holder", None),
            Err(LockError::InvalidHolder(_))
        ));
        assert!(c.stats().resources == 0);
    }

    #[test]
    fn test_status_of_untouched_resource_does_not_create_it() {
        let c = coordinator();
        let status = c.status("exam:5:results").unwrap();
        assert_eq!(status.mode, LockMode::Free);
        assert_eq!(c.stats().resources, 0);
    }

    #[test]
    fn test_release_write_on_unknown_resource() {
        let c = coordinator();
        assert!(matches!(
            c.release_write("exam:5:results", "t1"),
            Err(LockError::NotHolder { .. })
        ));
        assert!(c.release_read("exam:5:results", "s1").is_ok());
        assert_eq!(c.stats().resources, 0);
    }

    #[test]
    fn test_try_acquire_write_busy() {
        let c = coordinator();
        c.acquire_read("exam:1:results", "s1", None).unwrap();
        let err = c.try_acquire_write("exam:1:results", "t1", None).unwrap_err();
        assert!(matches!(err, LockError::LockBusy { mode: LockMode::Read, .. }));
        assert_eq!(c.status("exam:1:results").unwrap().queue_length, 0);
    }

    #[test]
    fn test_events_follow_transitions() {
        let c = coordinator();
        let mut sub = c.subscribe_to("exam:1:results").unwrap();

        c.acquire_write("exam:1:results", "t1", None).unwrap();
        c.acquire_write("exam:1:results", "t2", None).unwrap();
        c.release_write("exam:1:results", "t1").unwrap();

        let names: Vec<&str> = std::iter::from_fn(|| sub.try_recv()).map(|e| e.name()).collect();
        assert_eq!(names, vec!["lockAcquired", "lockReleased", "lockAcquired"]);
    }

    #[test]
    fn test_disconnect_across_resources() {
        let c = coordinator();
        c.acquire_write("exam:1:results", "t1", None).unwrap();
        c.acquire_read("exam:2:results", "t1", None).unwrap();
        c.acquire_read("exam:3:results", "s1", None).unwrap();
        c.acquire_write("exam:3:results", "t1", None).unwrap();

        assert_eq!(c.disconnect("t1").unwrap(), 3);
        assert_eq!(c.status("exam:1:results").unwrap().mode, LockMode::Free);
        assert_eq!(c.status("exam:3:results").unwrap().queue_length, 0);
        assert_eq!(c.disconnect("t1").unwrap(), 0);
    }

    #[test]
    fn test_stats_counts_drained_grants() {
        let c = coordinator();
        c.acquire_write("exam:1:results", "t1", None).unwrap();
        c.acquire_read("exam:1:results", "s1", None).unwrap();
        c.acquire_read("exam:1:results", "s2", None).unwrap();
        c.release_write("exam:1:results", "t1").unwrap();

        let stats = c.stats();
        assert_eq!(stats.total_grants, 3);
        assert_eq!(stats.total_releases, 1);
        assert_eq!(stats.read_held, 1);
        assert_eq!(stats.readers, 2);
    }

    #[test]
    fn test_cancel_reports_removal() {
        let c = coordinator();
        c.acquire_write("exam:1:results", "t1", None).unwrap();
        c.acquire_read("exam:1:results", "s1", None).unwrap();

        assert!(c.cancel("exam:1:results", "s1").unwrap());
        assert!(!c.cancel("exam:1:results", "s1").unwrap());
        assert_eq!(
            c.holder_state("exam:1:results", "s1").unwrap(),
            HolderState::Absent
        );
    }
}
