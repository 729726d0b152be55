//! Periodic lease reclamation and review-lock sweeping

use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vidpair_core::Result;

use crate::review::ReviewLockManager;
use crate::scheduler::{JobScheduler, ReclaimReport};
use crate::storage::Store;
use std::sync::Arc;

/// Result of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub leases: ReclaimReport,
    pub locks_released: usize,
}

#[derive(Clone)]
pub struct Maintenance {
    store: Arc<dyn Store>,
    scheduler: JobScheduler,
    locks: ReviewLockManager,
}

impl Maintenance {
    pub fn new(store: Arc<dyn Store>, scheduler: JobScheduler, locks: ReviewLockManager) -> Self {
        Self {
            store,
            scheduler,
            locks,
        }
    }

    /// Reclaim expired job leases and return expired review locks to the queue
    pub async fn run_once(&self) -> Result<SweepReport> {
        let leases = self.scheduler.reclaim_expired().await?;
        let locks_released = self.locks.sweep_expired_locks().await?;
        Ok(SweepReport {
            leases,
            locks_released,
        })
    }

    /// Sweep, then flush the store so the tick's changes survive a crash
    pub async fn tick(&self) -> Result<SweepReport> {
        let report = self.run_once().await?;
        self.store.flush().await?;
        Ok(report)
    }

    /// Run a sweep every `every` until `shutdown` is cancelled
    pub fn spawn(self, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("🧹 Maintenance sweeper started (every {}s)", every.as_secs());
            let mut ticker = interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("🛑 Maintenance sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.tick().await {
                            Ok(report) => debug!("Sweep finished: {:?}", report),
                            Err(e) => warn!("Maintenance sweep failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::{MemoryStore, Store};
    use chrono::Duration as ChronoDuration;
    use vidpair_core::{Chunk, ChunkState, Clock, JobStatus, ManualClock};

    #[tokio::test]
    async fn test_sweep_reclaims_and_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let config = Config::default();
        let scheduler = JobScheduler::new(store.clone(), clock.clone(), &config);
        let locks = ReviewLockManager::new(store.clone(), clock.clone(), &config.review);

        store
            .insert_chunk(Chunk::new("vid", 0, 0.0, 300.0, "a.wav", clock.now()))
            .await
            .unwrap();
        let lease = scheduler.acquire_next("w1").await.unwrap().unwrap();
        clock.advance(ChronoDuration::seconds(config.scheduler.lease_ttl_secs as i64 + 1));

        let shutdown = CancellationToken::new();
        let handle = Maintenance::new(store.clone(), scheduler, locks).spawn(Duration::from_millis(10), shutdown.clone());

        let mut requeued = false;
        for _ in 0..100 {
            let job = store.get_job(lease.job.id).await.unwrap().unwrap();
            if job.status == JobStatus::Queued {
                requeued = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(requeued);
        assert_eq!(store.list_chunks(Some(ChunkState::Pending)).await.unwrap().len(), 1);

        shutdown.cancel();
        tokio_test::assert_ok!(handle.await);
    }

    #[tokio::test]
    async fn test_tick_writes_the_snapshot() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("store.json");
        let store = Arc::new(MemoryStore::open(path.clone()).await.unwrap());
        let clock = Arc::new(ManualClock::default());
        let config = Config::default();
        let scheduler = JobScheduler::new(store.clone(), clock.clone(), &config);
        let locks = ReviewLockManager::new(store.clone(), clock.clone(), &config.review);

        store
            .insert_chunk(Chunk::new("vid", 0, 0.0, 300.0, "a.wav", clock.now()))
            .await
            .unwrap();
        let lease = scheduler.acquire_next("w1").await.unwrap().unwrap();
        clock.advance(ChronoDuration::seconds(config.scheduler.lease_ttl_secs as i64 + 1));

        let report = Maintenance::new(store.clone(), scheduler, locks).tick().await.unwrap();
        assert_eq!(report.leases.requeued, 1);

        let on_disk = MemoryStore::open_read_only(path).await.unwrap();
        let job = on_disk.get_job(lease.job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }
}
