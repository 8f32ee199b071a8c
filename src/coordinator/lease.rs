//! Lease monitor
//!
//! Background task that sweeps the lock table on a fixed tick. Every expired
//! holder is evicted exactly as a release would, so a holder that vanished
//! without releasing blocks others for at most its lease plus one tick.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::service::MarksCoordinator;

/// Periodic lease sweeper
pub struct LeaseMonitor {
    coordinator: Arc<MarksCoordinator>,
    tick: Duration,
}

impl LeaseMonitor {
    /// Monitor ticking at the coordinator's configured interval
    pub fn new(coordinator: Arc<MarksCoordinator>) -> Self {
        let tick = coordinator.config().monitor_tick();
        Self { coordinator, tick }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Spawn the sweep loop on the current runtime
    pub fn start(self) -> MonitorHandle {
        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let Self { coordinator, tick } = self;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(tick_ms = tick.as_millis() as u64, "Lease monitor started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = coordinator.sweep_expired();
                        if !report.is_empty() {
                            tracing::debug!(
                                evicted = report.evicted,
                                pruned = report.pruned,
                                "Lease sweep"
                            );
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Lease monitor stopped");
                        break;
                    }
                }
            }
        });

        MonitorHandle { shutdown, task }
    }
}

/// Handle to a running lease monitor
pub struct MonitorHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the loop and wait for it to exit
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Lease monitor task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::config::CoordinatorConfig;
    use crate::coordinator::types::LockMode;

    fn coordinator() -> Arc<MarksCoordinator> {
        let config = CoordinatorConfig::builder()
            .lease_bounds_ms(1_000, 60_000)
            .default_lease_ms(2_000)
            .monitor_tick_ms(250)
            .build()
            .unwrap();
        Arc::new(MarksCoordinator::new(config))
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_evicts_expired_writer() {
        let c = coordinator();
        c.acquire_write("exam:1:results", "t1", None).unwrap();
        let handle = LeaseMonitor::new(Arc::clone(&c)).start();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(c.status("exam:1:results").unwrap().mode, LockMode::Write);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(c.status("exam:1:results").unwrap().mode, LockMode::Free);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_task() {
        let c = coordinator();
        let handle = LeaseMonitor::new(c).with_tick(Duration::from_millis(100)).start();
        assert!(!handle.is_finished());
        handle.stop().await;
    }
}
