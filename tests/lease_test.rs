//! Lease expiry tests
//!
//! Run on a paused clock, so leases of several seconds elapse instantly while
//! the lease monitor ticks exactly as it does in production.

use std::sync::Arc;
use std::time::Duration;

use markgate::coordinator::{
    CoordinatorConfig, HolderState, LeaseMonitor, LockError, LockMode, MarksCoordinator,
};

const EXAM: &str = "exam:42:results";

fn coordinator() -> Arc<MarksCoordinator> {
    Arc::new(MarksCoordinator::new(CoordinatorConfig::default()))
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_writer_evicted_and_reader_granted() {
    let c = coordinator();
    let monitor = LeaseMonitor::new(Arc::clone(&c)).start();

    assert!(c.acquire_write(EXAM, "teacher-3", Some(5_000)).unwrap().is_granted());
    assert!(!c.acquire_read(EXAM, "student-1", None).unwrap().is_granted());

    advance(4_500).await;
    assert_eq!(c.status(EXAM).unwrap().mode, LockMode::Write);

    // Lease plus one monitor tick
    advance(1_600).await;
    let status = c.status(EXAM).unwrap();
    assert_eq!(status.mode, LockMode::Read);
    assert!(status.writer_id.is_none());
    assert_eq!(c.holder_state(EXAM, "student-1").unwrap(), HolderState::Reading);
    assert_eq!(c.stats().total_evictions, 1);

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_keeps_lease_alive() {
    let c = coordinator();
    let monitor = LeaseMonitor::new(Arc::clone(&c)).start();

    c.acquire_write(EXAM, "teacher", Some(3_000)).unwrap();
    for _ in 0..6 {
        advance(2_000).await;
        let ack = c.heartbeat(EXAM, "teacher").unwrap();
        assert_eq!(ack.expires_in_ms, 3_000);
    }
    assert_eq!(c.status(EXAM).unwrap().mode, LockMode::Write);

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_late_heartbeat_reports_lease_expired() {
    let c = coordinator();
    let monitor = LeaseMonitor::new(Arc::clone(&c)).start();

    c.acquire_write(EXAM, "teacher", Some(3_000)).unwrap();
    advance(4_500).await;

    assert_eq!(c.status(EXAM).unwrap().mode, LockMode::Free);
    assert!(matches!(
        c.heartbeat(EXAM, "teacher"),
        Err(LockError::LeaseExpired { .. })
    ));
    // Someone who never held it is told apart
    assert!(matches!(
        c.heartbeat(EXAM, "student-9"),
        Err(LockError::NotHolder { .. })
    ));
    // Releasing after eviction converges instead of failing
    c.release_write(EXAM, "teacher").unwrap();

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reacquire_after_eviction_starts_fresh() {
    let c = coordinator();
    let monitor = LeaseMonitor::new(Arc::clone(&c)).start();

    c.acquire_read(EXAM, "student", Some(2_000)).unwrap();
    advance(3_500).await;
    assert!(matches!(c.heartbeat(EXAM, "student"), Err(LockError::LeaseExpired { .. })));

    assert!(c.acquire_read(EXAM, "student", Some(2_000)).unwrap().is_granted());
    assert_eq!(c.heartbeat(EXAM, "student").unwrap().expires_in_ms, 2_000);

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_waiter_with_equal_lease_granted_after_writer_expires() {
    let c = coordinator();
    let monitor = LeaseMonitor::new(Arc::clone(&c)).start();

    c.acquire_write(EXAM, "teacher-3", Some(5_000)).unwrap();
    assert!(!c.acquire_read(EXAM, "student-1", Some(5_000)).unwrap().is_granted());

    advance(6_100).await;
    let status = c.status(EXAM).unwrap();
    assert_eq!(status.mode, LockMode::Read);
    assert_eq!(status.queue_length, 0);
    assert_eq!(c.holder_state(EXAM, "student-1").unwrap(), HolderState::Reading);

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_queued_writer_outlives_its_own_lease() {
    let c = coordinator();
    let monitor = LeaseMonitor::new(Arc::clone(&c)).start();

    c.acquire_read(EXAM, "student-1", Some(60_000)).unwrap();
    assert!(!c.acquire_write(EXAM, "teacher", Some(30_000)).unwrap().is_granted());

    advance(31_500).await;
    assert!(matches!(
        c.holder_state(EXAM, "teacher").unwrap(),
        HolderState::Queued { position: 1, .. }
    ));
    // A reader arriving now still lines up behind the teacher
    assert!(!c.acquire_read(EXAM, "student-2", None).unwrap().is_granted());

    c.release_read(EXAM, "student-1").unwrap();
    let status = c.status(EXAM).unwrap();
    assert_eq!(status.mode, LockMode::Write);
    assert_eq!(status.writer_id.unwrap().as_str(), "teacher");
    assert_eq!(c.stats().total_evictions, 0);

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_waiter_heartbeat_is_not_holder() {
    let c = coordinator();
    let monitor = LeaseMonitor::new(Arc::clone(&c)).start();

    c.acquire_write(EXAM, "teacher", Some(20_000)).unwrap();
    c.acquire_read(EXAM, "student", Some(2_000)).unwrap();

    advance(1_500).await;
    assert!(matches!(
        c.heartbeat(EXAM, "student"),
        Err(LockError::NotHolder { .. })
    ));

    // Without heartbeats the request keeps its place
    advance(5_000).await;
    assert!(matches!(
        c.holder_state(EXAM, "student").unwrap(),
        HolderState::Queued { position: 1, .. }
    ));

    c.release_write(EXAM, "teacher").unwrap();
    assert_eq!(c.holder_state(EXAM, "student").unwrap(), HolderState::Reading);

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_expired_resource_eventually_pruned() {
    let c = coordinator();
    let monitor = LeaseMonitor::new(Arc::clone(&c)).start();

    c.acquire_write(EXAM, "teacher", Some(2_000)).unwrap();
    advance(3_500).await;
    // Kept while the evicted holder can still be answered
    assert_eq!(c.stats().resources, 1);

    let retention = c.config().tombstone_retention().as_millis() as u64;
    advance(retention + 2_000).await;
    assert_eq!(c.stats().resources, 0);
    assert!(matches!(c.heartbeat(EXAM, "teacher"), Err(LockError::NotHolder { .. })));

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_expiry_publishes_release_event() {
    let c = coordinator();
    let mut events = c.subscribe_to(EXAM).unwrap();
    let monitor = LeaseMonitor::new(Arc::clone(&c)).start();

    c.acquire_write(EXAM, "teacher", Some(2_000)).unwrap();
    advance(3_500).await;

    let acquired = events.recv().await.unwrap();
    assert_eq!(acquired.name(), "lockAcquired");
    let released = events.recv().await.unwrap();
    assert_eq!(released.name(), "lockReleased");
    assert_eq!(released.mode(), LockMode::Write);

    monitor.stop().await;
}
