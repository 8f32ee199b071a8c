//! Lock table: per-resource read/write state machine
//!
//! Each resource owns its state behind its own mutex; the table itself is a
//! sharded map, so unrelated exams never contend on a shared lock.
//!
//! The queue is write-preferring: once a write request is queued, later read
//! requests line up behind it instead of joining the current readers. When the
//! resource drains, the queue head is granted alone if it is a writer, or together
//! with every consecutive reader behind it.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::error::{LockError, LockResult};
use super::types::{
    AccessMode, Acquisition, HeartbeatAck, HolderId, HolderState, LockMode, ResourceId,
    StatusSnapshot,
};

// ============================================================================
// Leases and pending requests
// ============================================================================

/// A time-bounded grant
#[derive(Debug, Clone, Copy)]
struct Lease {
    duration: Duration,
    expires_at: Instant,
}

impl Lease {
    fn new(duration: Duration, now: Instant) -> Self {
        Self {
            duration,
            expires_at: now + duration,
        }
    }

    fn renew(&mut self, now: Instant) {
        self.expires_at = now + self.duration;
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// A blocked caller waiting for its turn
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub requester: HolderId,
    pub mode: AccessMode,
    pub enqueued_at: Instant,
    /// Lease the requester gets once granted
    lease_duration: Duration,
}

// ============================================================================
// Transitions
// ============================================================================

/// Lock-state change produced by an operation, published by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// A free resource became held, or queued requests were granted
    Acquired {
        mode: LockMode,
        grantees: Vec<HolderId>,
    },
    /// A held resource became free
    Released { mode: LockMode },
}

/// What a lease sweep removed from one resource
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Holders whose lease elapsed
    pub evicted: Vec<(HolderId, AccessMode)>,
    pub transitions: Vec<Transition>,
}

impl SweepOutcome {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty()
    }
}

// ============================================================================
// Per-resource state machine
// ============================================================================

/// Lock state of a single resource
#[derive(Debug)]
pub struct ResourceLock {
    id: ResourceId,
    readers: HashMap<HolderId, Lease>,
    writer: Option<(HolderId, Lease)>,
    queue: VecDeque<PendingRequest>,
    /// Holders removed by lease expiry, kept so a late heartbeat can be told apart
    /// from a caller that never held the resource
    evicted: HashMap<HolderId, Instant>,
}

impl ResourceLock {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            readers: HashMap::new(),
            writer: None,
            queue: VecDeque::new(),
            evicted: HashMap::new(),
        }
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    /// Current mode, derived from the holders so readers and writer never coexist
    pub fn mode(&self) -> LockMode {
        if self.writer.is_some() {
            LockMode::Write
        } else if !self.readers.is_empty() {
            LockMode::Read
        } else {
            LockMode::Free
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            resource_id: self.id.clone(),
            mode: self.mode(),
            reader_count: self.readers.len(),
            writer_id: self.writer.as_ref().map(|(holder, _)| holder.clone()),
            queue_length: self.queue.len(),
        }
    }

    pub fn holder_state(&self, holder: &HolderId) -> HolderState {
        if self.is_writer(holder) {
            HolderState::Writing
        } else if self.readers.contains_key(holder) {
            HolderState::Reading
        } else if let Some((position, mode)) = self.queue_position(holder) {
            HolderState::Queued { position, mode }
        } else {
            HolderState::Absent
        }
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Requests in queue order
    pub fn queued(&self) -> impl Iterator<Item = &PendingRequest> {
        self.queue.iter()
    }

    /// Free, nobody waiting, and no evicted holder left to answer
    pub fn is_idle(&self) -> bool {
        self.mode() == LockMode::Free && self.queue.is_empty() && self.evicted.is_empty()
    }

    fn is_writer(&self, holder: &HolderId) -> bool {
        matches!(&self.writer, Some((writer, _)) if writer == holder)
    }

    /// 1-based queue position of a holder's pending request
    fn queue_position(&self, holder: &HolderId) -> Option<(usize, AccessMode)> {
        self.queue
            .iter()
            .position(|request| &request.requester == holder)
            .map(|index| (index + 1, self.queue[index].mode))
    }

    fn has_queued_write(&self) -> bool {
        self.queue.iter().any(|request| request.mode == AccessMode::Write)
    }

    fn can_admit_reader(&self) -> bool {
        self.writer.is_none() && !self.has_queued_write()
    }

    fn can_admit_writer(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty() && self.queue.is_empty()
    }

    fn pending(&self, position: usize) -> Acquisition {
        Acquisition::Pending {
            queue_position: position,
            blocked_by: self.mode(),
        }
    }

    fn enqueue(&mut self, holder: &HolderId, mode: AccessMode, lease: Duration, now: Instant) -> usize {
        self.queue.push_back(PendingRequest {
            requester: holder.clone(),
            mode,
            enqueued_at: now,
            lease_duration: lease,
        });
        self.queue.len()
    }

    fn remove_queued(&mut self, holder: &HolderId, mode: Option<AccessMode>) -> bool {
        let before = self.queue.len();
        self.queue
            .retain(|r| !(&r.requester == holder && mode.map_or(true, |m| r.mode == m)));
        self.queue.len() != before
    }

    /// Grant the queue head: one writer, or a run of consecutive readers
    fn drain(&mut self, now: Instant, transitions: &mut Vec<Transition>) {
        let mut grantees = Vec::new();
        let mut granted_mode = LockMode::Free;

        while let Some(head_mode) = self.queue.front().map(|r| r.mode) {
            match head_mode {
                AccessMode::Write => {
                    if self.writer.is_none() && self.readers.is_empty() {
                        if let Some(request) = self.queue.pop_front() {
                            self.evicted.remove(&request.requester);
                            self.writer = Some((
                                request.requester.clone(),
                                Lease::new(request.lease_duration, now),
                            ));
                            grantees.push(request.requester);
                            granted_mode = LockMode::Write;
                        }
                    }
                    break;
                }
                AccessMode::Read => {
                    if self.writer.is_some() {
                        break;
                    }
                    if let Some(request) = self.queue.pop_front() {
                        self.evicted.remove(&request.requester);
                        self.readers.insert(
                            request.requester.clone(),
                            Lease::new(request.lease_duration, now),
                        );
                        grantees.push(request.requester);
                        granted_mode = LockMode::Read;
                    }
                }
            }
        }

        if !grantees.is_empty() {
            transitions.push(Transition::Acquired {
                mode: granted_mode,
                grantees,
            });
        }
    }

    /// Record a release and grant whoever is next
    fn settle_after_release(&mut self, released: LockMode, now: Instant, transitions: &mut Vec<Transition>) {
        if released != LockMode::Free && self.mode() == LockMode::Free {
            transitions.push(Transition::Released { mode: released });
        }
        self.drain(now, transitions);
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    pub fn acquire_read(&mut self, holder: &HolderId, lease: Duration, now: Instant) -> (Acquisition, Vec<Transition>) {
        let mut transitions = Vec::new();

        if let Some((_, writer_lease)) = self.writer.as_mut().filter(|(w, _)| w == holder) {
            writer_lease.renew(now);
            return (Acquisition::Granted, transitions);
        }
        if let Some(reader_lease) = self.readers.get_mut(holder) {
            *reader_lease = Lease::new(lease, now);
            return (Acquisition::Granted, transitions);
        }
        if let Some((position, _)) = self.queue_position(holder) {
            return (self.pending(position), transitions);
        }

        if self.can_admit_reader() {
            let was_free = self.mode() == LockMode::Free;
            self.evicted.remove(holder);
            self.readers.insert(holder.clone(), Lease::new(lease, now));
            if was_free {
                transitions.push(Transition::Acquired {
                    mode: LockMode::Read,
                    grantees: vec![holder.clone()],
                });
            }
            return (Acquisition::Granted, transitions);
        }

        let blocked_by = self.mode();
        let position = self.enqueue(holder, AccessMode::Read, lease, now);
        (
            Acquisition::Pending {
                queue_position: position,
                blocked_by,
            },
            transitions,
        )
    }

    pub fn acquire_write(&mut self, holder: &HolderId, lease: Duration, now: Instant) -> (Acquisition, Vec<Transition>) {
        let mut transitions = Vec::new();

        if let Some((_, writer_lease)) = self.writer.as_mut().filter(|(w, _)| w == holder) {
            *writer_lease = Lease::new(lease, now);
            return (Acquisition::Granted, transitions);
        }
        if let Some((position, _)) = self.queue_position(holder) {
            return (self.pending(position), transitions);
        }

        if self.readers.contains_key(holder) {
            if self.readers.len() == 1 && self.queue.is_empty() {
                // Sole reader with nobody waiting: upgrade in place
                self.readers.remove(holder);
                transitions.push(Transition::Released { mode: LockMode::Read });
                self.writer = Some((holder.clone(), Lease::new(lease, now)));
                transitions.push(Transition::Acquired {
                    mode: LockMode::Write,
                    grantees: vec![holder.clone()],
                });
                return (Acquisition::Granted, transitions);
            }

            // It cannot wait on its own read hold
            self.readers.remove(holder);
            self.enqueue(holder, AccessMode::Write, lease, now);
            self.settle_after_release(LockMode::Read, now, &mut transitions);
            return match self.queue_position(holder) {
                Some((position, _)) => (self.pending(position), transitions),
                None => (Acquisition::Granted, transitions),
            };
        }

        if self.can_admit_writer() {
            self.evicted.remove(holder);
            self.writer = Some((holder.clone(), Lease::new(lease, now)));
            transitions.push(Transition::Acquired {
                mode: LockMode::Write,
                grantees: vec![holder.clone()],
            });
            return (Acquisition::Granted, transitions);
        }

        let blocked_by = self.mode();
        let position = self.enqueue(holder, AccessMode::Write, lease, now);
        (
            Acquisition::Pending {
                queue_position: position,
                blocked_by,
            },
            transitions,
        )
    }

    /// Non-queuing read: grants or reports the resource busy
    pub fn try_acquire_read(&mut self, holder: &HolderId, lease: Duration, now: Instant) -> LockResult<Vec<Transition>> {
        let holds = self.is_writer(holder) || self.readers.contains_key(holder);
        if !holds && !self.can_admit_reader() {
            return Err(LockError::LockBusy {
                resource: self.id.clone(),
                mode: self.busy_mode(),
            });
        }
        Ok(self.acquire_read(holder, lease, now).1)
    }

    /// Non-queuing write: grants or reports the resource busy
    pub fn try_acquire_write(&mut self, holder: &HolderId, lease: Duration, now: Instant) -> LockResult<Vec<Transition>> {
        let sole_reader = self.readers.len() == 1 && self.readers.contains_key(holder) && self.queue.is_empty();
        if !self.is_writer(holder) && !sole_reader && !self.can_admit_writer() {
            return Err(LockError::LockBusy {
                resource: self.id.clone(),
                mode: self.busy_mode(),
            });
        }
        Ok(self.acquire_write(holder, lease, now).1)
    }

    /// Mode reported to callers refused by a try-acquire
    fn busy_mode(&self) -> LockMode {
        match self.mode() {
            // Free but queued can only be transient; the queue head is a writer
            LockMode::Free => LockMode::Write,
            mode => mode,
        }
    }

    /// Idempotent: releasing a reader that is not present is a no-op. A holder
    /// that is only queued for reading has its request cancelled.
    pub fn release_read(&mut self, holder: &HolderId, now: Instant) -> Vec<Transition> {
        let mut transitions = Vec::new();
        if self.readers.remove(holder).is_some() {
            self.settle_after_release(LockMode::Read, now, &mut transitions);
        } else if self.remove_queued(holder, Some(AccessMode::Read)) {
            self.drain(now, &mut transitions);
        }
        transitions
    }

    /// Only the current writer may release. A queued writer cancels its request,
    /// and a writer already evicted by lease expiry gets a no-op.
    pub fn release_write(&mut self, holder: &HolderId, now: Instant) -> LockResult<Vec<Transition>> {
        let mut transitions = Vec::new();
        if self.is_writer(holder) {
            self.writer = None;
            self.settle_after_release(LockMode::Write, now, &mut transitions);
            return Ok(transitions);
        }
        if self.remove_queued(holder, Some(AccessMode::Write)) {
            self.drain(now, &mut transitions);
            return Ok(transitions);
        }
        if self.evicted.contains_key(holder) {
            return Ok(transitions);
        }
        Err(LockError::NotHolder {
            resource: self.id.clone(),
            holder: holder.clone(),
        })
    }

    /// Extend a granted holder's lease. A request that is only queued holds no
    /// lease, so its requester is not a holder.
    pub fn heartbeat(&mut self, holder: &HolderId, now: Instant) -> LockResult<HeartbeatAck> {
        let renewed = if let Some((_, lease)) = self.writer.as_mut().filter(|(w, _)| w == holder) {
            lease.renew(now);
            Some(lease.duration)
        } else if let Some(lease) = self.readers.get_mut(holder) {
            lease.renew(now);
            Some(lease.duration)
        } else {
            None
        };

        match renewed {
            Some(duration) => Ok(HeartbeatAck {
                expires_in_ms: duration.as_millis() as u64,
            }),
            None if self.evicted.contains_key(holder) => Err(LockError::LeaseExpired {
                resource: self.id.clone(),
                holder: holder.clone(),
            }),
            None => Err(LockError::NotHolder {
                resource: self.id.clone(),
                holder: holder.clone(),
            }),
        }
    }

    /// Withdraw a holder's pending request. Returns whether one was removed.
    pub fn cancel(&mut self, holder: &HolderId, now: Instant) -> (bool, Vec<Transition>) {
        let mut transitions = Vec::new();
        let removed = self.remove_queued(holder, None);
        if removed {
            self.drain(now, &mut transitions);
        }
        (removed, transitions)
    }

    /// Drop every hold and pending request of a holder. Returns how many were removed.
    pub fn disconnect(&mut self, holder: &HolderId, now: Instant) -> (usize, Vec<Transition>) {
        let mut transitions = Vec::new();
        let mut removed = 0;

        let before = self.mode();
        if self.is_writer(holder) {
            self.writer = None;
            removed += 1;
        }
        if self.readers.remove(holder).is_some() {
            removed += 1;
        }
        if self.remove_queued(holder, None) {
            removed += 1;
        }
        self.evicted.remove(holder);

        if removed > 0 {
            self.settle_after_release(before, now, &mut transitions);
        }
        (removed, transitions)
    }

    /// Evict expired holders exactly as a release would. Queued requests never
    /// expire; they leave the queue only when granted, cancelled or disconnected.
    pub fn sweep(&mut self, now: Instant, tombstone_retention: Duration) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let before = self.mode();

        if self.writer.as_ref().is_some_and(|(_, lease)| lease.is_expired(now)) {
            if let Some((holder, _)) = self.writer.take() {
                self.evicted.insert(holder.clone(), now);
                outcome.evicted.push((holder, AccessMode::Write));
            }
        }

        let expired: Vec<HolderId> = self
            .readers
            .iter()
            .filter(|(_, lease)| lease.is_expired(now))
            .map(|(holder, _)| holder.clone())
            .collect();
        for holder in expired {
            self.readers.remove(&holder);
            self.evicted.insert(holder.clone(), now);
            outcome.evicted.push((holder, AccessMode::Read));
        }

        if !outcome.is_empty() {
            self.settle_after_release(before, now, &mut outcome.transitions);
        }

        self.evicted
            .retain(|_, evicted_at| now.saturating_duration_since(*evicted_at) < tombstone_retention);

        outcome
    }
}

// ============================================================================
// Lock Table
// ============================================================================

/// Sharded map of resource id to its lock state
#[derive(Debug, Default)]
pub struct LockTable {
    resources: DashMap<ResourceId, Arc<Mutex<ResourceLock>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` inside the resource's critical section, creating the resource lazily
    pub fn with_resource<R>(&self, id: &ResourceId, f: impl FnOnce(&mut ResourceLock) -> R) -> R {
        let slot = self.slot(id);
        let mut state = slot.lock();
        f(&mut state)
    }

    /// Like `with_resource`, but never creates a record for an untouched id
    pub fn with_existing<R>(&self, id: &ResourceId, f: impl FnOnce(&mut ResourceLock) -> R) -> Option<R> {
        let slot = self.resources.get(id).map(|entry| Arc::clone(entry.value()))?;
        let mut state = slot.lock();
        Some(f(&mut state))
    }

    fn slot(&self, id: &ResourceId) -> Arc<Mutex<ResourceLock>> {
        if let Some(entry) = self.resources.get(id) {
            return Arc::clone(entry.value());
        }
        Arc::clone(
            self.resources
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(ResourceLock::new(id.clone()))))
                .value(),
        )
    }

    /// Handles to every resource; the map is not locked while callers work on them
    pub fn slots(&self) -> Vec<Arc<Mutex<ResourceLock>>> {
        self.resources.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Drop records of idle resources. Returns how many were removed.
    ///
    /// Candidates are found on cloned handles, so no shard guard is held while a
    /// resource mutex is awaited. A record is only removed while no caller holds
    /// its handle, so an operation that already looked the resource up never
    /// works on a detached record; the mutex of such a record is uncontended.
    pub fn prune_idle(&self) -> usize {
        let idle: Vec<ResourceId> = self
            .slots()
            .into_iter()
            .filter_map(|slot| {
                let state = slot.lock();
                state.is_idle().then(|| state.id().clone())
            })
            .collect();

        idle.iter()
            .filter(|id| {
                self.resources
                    .remove_if(*id, |_, slot| Arc::strong_count(slot) == 1 && slot.lock().is_idle())
                    .is_some()
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(10);

    fn holder(s: &str) -> HolderId {
        HolderId::parse(s).unwrap()
    }

    fn resource() -> ResourceLock {
        ResourceLock::new(ResourceId::parse("exam:1:results").unwrap())
    }

    #[test]
    fn test_first_reader_emits_acquired() {
        let mut lock = resource();
        let now = Instant::now();

        let (outcome, transitions) = lock.acquire_read(&holder("s1"), LEASE, now);
        assert!(outcome.is_granted());
        assert_eq!(
            transitions,
            vec![Transition::Acquired {
                mode: LockMode::Read,
                grantees: vec![holder("s1")]
            }]
        );

        // Joining readers is not a mode transition
        let (_, transitions) = lock.acquire_read(&holder("s2"), LEASE, now);
        assert!(transitions.is_empty());
        assert_eq!(lock.mode(), LockMode::Read);
        assert_eq!(lock.reader_count(), 2);
    }

    #[test]
    fn test_writer_blocks_reader() {
        let mut lock = resource();
        let now = Instant::now();
        lock.acquire_write(&holder("t1"), LEASE, now);

        let (outcome, _) = lock.acquire_read(&holder("s1"), LEASE, now);
        assert_eq!(
            outcome,
            Acquisition::Pending {
                queue_position: 1,
                blocked_by: LockMode::Write
            }
        );
    }

    #[test]
    fn test_release_write_grants_reader_run() {
        let mut lock = resource();
        let now = Instant::now();
        lock.acquire_write(&holder("t1"), LEASE, now);
        lock.acquire_read(&holder("s1"), LEASE, now);
        lock.acquire_read(&holder("s2"), LEASE, now);
        lock.acquire_write(&holder("t2"), LEASE, now);
        lock.acquire_read(&holder("s3"), LEASE, now);

        let transitions = lock.release_write(&holder("t1"), now).unwrap();
        assert_eq!(
            transitions,
            vec![
                Transition::Released { mode: LockMode::Write },
                Transition::Acquired {
                    mode: LockMode::Read,
                    grantees: vec![holder("s1"), holder("s2")]
                }
            ]
        );
        // t2 and s3 stay queued, in order
        assert_eq!(lock.queue_len(), 2);
        assert_eq!(
            lock.holder_state(&holder("t2")),
            HolderState::Queued {
                position: 1,
                mode: AccessMode::Write
            }
        );
    }

    #[test]
    fn test_release_write_by_non_holder() {
        let mut lock = resource();
        let now = Instant::now();
        lock.acquire_write(&holder("teacher-3"), LEASE, now);

        let err = lock.release_write(&holder("student-7"), now).unwrap_err();
        assert!(matches!(err, LockError::NotHolder { .. }));
        assert_eq!(lock.status().writer_id, Some(holder("teacher-3")));
    }

    #[test]
    fn test_release_read_is_idempotent() {
        let mut lock = resource();
        let now = Instant::now();
        lock.acquire_read(&holder("s1"), LEASE, now);

        assert_eq!(lock.release_read(&holder("s1"), now).len(), 1);
        assert!(lock.release_read(&holder("s1"), now).is_empty());
        assert!(lock.release_read(&holder("never"), now).is_empty());
        assert_eq!(lock.mode(), LockMode::Free);
    }

    #[test]
    fn test_sole_reader_upgrades() {
        let mut lock = resource();
        let now = Instant::now();
        lock.acquire_read(&holder("t1"), LEASE, now);

        let (outcome, transitions) = lock.acquire_write(&holder("t1"), LEASE, now);
        assert!(outcome.is_granted());
        assert_eq!(lock.mode(), LockMode::Write);
        assert_eq!(transitions.len(), 2);
    }

    #[test]
    fn test_shared_reader_requesting_write_gives_up_read() {
        let mut lock = resource();
        let now = Instant::now();
        lock.acquire_read(&holder("t1"), LEASE, now);
        lock.acquire_read(&holder("s1"), LEASE, now);

        let (outcome, _) = lock.acquire_write(&holder("t1"), LEASE, now);
        assert_eq!(outcome.queue_position(), Some(1));
        assert_eq!(lock.reader_count(), 1);

        lock.release_read(&holder("s1"), now);
        assert_eq!(lock.holder_state(&holder("t1")), HolderState::Writing);
    }

    #[test]
    fn test_cancel_queued_writer_unblocks_readers() {
        let mut lock = resource();
        let now = Instant::now();
        lock.acquire_read(&holder("s1"), LEASE, now);
        lock.acquire_write(&holder("t1"), LEASE, now);
        lock.acquire_read(&holder("s2"), LEASE, now);
        assert_eq!(lock.queue_len(), 2);

        let (removed, transitions) = lock.cancel(&holder("t1"), now);
        assert!(removed);
        assert_eq!(lock.reader_count(), 2);
        assert_eq!(
            transitions,
            vec![Transition::Acquired {
                mode: LockMode::Read,
                grantees: vec![holder("s2")]
            }]
        );
    }

    #[test]
    fn test_sweep_evicts_and_tombstones() {
        let mut lock = resource();
        let now = Instant::now();
        lock.acquire_write(&holder("t1"), Duration::from_secs(5), now);
        lock.acquire_read(&holder("s1"), Duration::from_secs(60), now);

        let later = now + Duration::from_secs(6);
        let outcome = lock.sweep(later, Duration::from_secs(120));
        assert_eq!(outcome.evicted, vec![(holder("t1"), AccessMode::Write)]);
        assert_eq!(lock.holder_state(&holder("s1")), HolderState::Reading);

        assert!(matches!(
            lock.heartbeat(&holder("t1"), later),
            Err(LockError::LeaseExpired { .. })
        ));
        // The late unload-triggered release converges with the eviction
        assert!(lock.release_write(&holder("t1"), later).unwrap().is_empty());
    }

    #[test]
    fn test_sweep_keeps_waiter_past_its_lease() {
        let mut lock = resource();
        let now = Instant::now();
        lock.acquire_write(&holder("t1"), Duration::from_secs(60), now);
        lock.acquire_write(&holder("t2"), Duration::from_secs(5), now);

        let outcome = lock.sweep(now + Duration::from_secs(30), Duration::from_secs(120));
        assert!(outcome.is_empty());
        assert_eq!(lock.queue_len(), 1);

        // The lease starts at the grant, not at the enqueue
        let later = now + Duration::from_secs(61);
        let outcome = lock.sweep(later, Duration::from_secs(120));
        assert_eq!(outcome.evicted, vec![(holder("t1"), AccessMode::Write)]);
        assert_eq!(lock.holder_state(&holder("t2")), HolderState::Writing);
        assert!(lock.sweep(later + Duration::from_secs(4), Duration::from_secs(120)).is_empty());
    }

    #[test]
    fn test_heartbeat_from_waiter_is_not_holder() {
        let mut lock = resource();
        let now = Instant::now();
        lock.acquire_write(&holder("t1"), Duration::from_secs(60), now);
        lock.acquire_write(&holder("t2"), Duration::from_secs(5), now);

        assert!(matches!(
            lock.heartbeat(&holder("t2"), now + Duration::from_secs(4)),
            Err(LockError::NotHolder { .. })
        ));
        assert_eq!(lock.queue_len(), 1);
    }

    #[test]
    fn test_tombstones_expire() {
        let mut lock = resource();
        let now = Instant::now();
        lock.acquire_read(&holder("s1"), Duration::from_secs(2), now);
        lock.sweep(now + Duration::from_secs(3), Duration::from_secs(10));

        lock.sweep(now + Duration::from_secs(20), Duration::from_secs(10));
        assert!(matches!(
            lock.heartbeat(&holder("s1"), now + Duration::from_secs(20)),
            Err(LockError::NotHolder { .. })
        ));
    }

    #[test]
    fn test_disconnect_releases_everything() {
        let mut lock = resource();
        let now = Instant::now();
        lock.acquire_write(&holder("t1"), LEASE, now);
        lock.acquire_write(&holder("t2"), LEASE, now);

        let (removed, transitions) = lock.disconnect(&holder("t1"), now);
        assert_eq!(removed, 1);
        assert_eq!(transitions.len(), 2);
        assert_eq!(lock.holder_state(&holder("t2")), HolderState::Writing);

        let (removed, _) = lock.disconnect(&holder("t1"), now);
        assert_eq!(removed, 0);
    }

    #[test]
    fn test_try_acquire_read_busy() {
        let mut lock = resource();
        let now = Instant::now();
        lock.acquire_write(&holder("t1"), LEASE, now);

        let err = lock.try_acquire_read(&holder("s1"), LEASE, now).unwrap_err();
        assert_eq!(
            err,
            LockError::LockBusy {
                resource: lock.id().clone(),
                mode: LockMode::Write
            }
        );
        assert_eq!(lock.queue_len(), 0);
    }

    #[test]
    fn test_table_lazy_creation() {
        let table = LockTable::new();
        let id = ResourceId::parse("exam:9:results").unwrap();

        assert!(table.with_existing(&id, |lock| lock.mode()).is_none());
        assert!(table.is_empty());

        let mode = table.with_resource(&id, |lock| {
            lock.acquire_read(&holder("s1"), LEASE, Instant::now());
            lock.mode()
        });
        assert_eq!(mode, LockMode::Read);
        assert_eq!(table.len(), 1);
        assert_eq!(table.slots().len(), 1);
    }

    #[test]
    fn test_prune_idle_keeps_busy_resources() {
        let table = LockTable::new();
        let busy = ResourceId::parse("exam:1:results").unwrap();
        let idle = ResourceId::parse("exam:2:results").unwrap();
        let now = Instant::now();

        table.with_resource(&busy, |lock| lock.acquire_write(&holder("t1"), LEASE, now));
        table.with_resource(&idle, |lock| {
            lock.acquire_read(&holder("s1"), LEASE, now);
            lock.release_read(&holder("s1"), now);
        });

        // A handle in use pins the record
        let pinned = table.slots();
        assert_eq!(table.prune_idle(), 0);
        drop(pinned);

        assert_eq!(table.prune_idle(), 1);
        assert_eq!(table.len(), 1);
        assert!(table.with_existing(&idle, |_| ()).is_none());
    }

    #[test]
    fn test_prune_waiting_on_busy_resource_does_not_block_creation() {
        let table = LockTable::new();
        let busy = ResourceId::parse("exam:1:results").unwrap();
        let now = Instant::now();
        table.with_resource(&busy, |lock| lock.acquire_write(&holder("t1"), LEASE, now));

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let table = &table;
        let busy = &busy;

        std::thread::scope(|scope| {
            scope.spawn(move || {
                table.with_resource(busy, |_| {
                    locked_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                });
            });
            locked_rx.recv().unwrap();

            let pruner = scope.spawn(move || table.prune_idle());
            std::thread::sleep(Duration::from_millis(50));

            // Every shard stays writable while the pruner waits on the busy mutex
            for i in 0..64 {
                let id = ResourceId::parse(format!("exam:{}:results", i + 2)).unwrap();
                table.with_resource(&id, |lock| lock.acquire_read(&holder("s1"), LEASE, now));
            }

            release_tx.send(()).unwrap();
            assert_eq!(pruner.join().unwrap(), 0);
        });

        assert_eq!(table.len(), 65);
    }
}
