//! Location sync worker: periodic two-phase migration of position updates
//! from the ephemeral store to the durable store.
//!
//! Five phases per run:
//!
//! 1. **Snapshot** — atomically move active-dirty into processing
//! 2. **Gather** — read current records, dropping entries that expired
//! 3. **Persist** — idempotent durable updates, in parallel, per-driver outcome
//! 4. **Reconcile** — clear persisted ids; merge failures back, newer value wins
//! 5. **Fatal recovery** — on restart, leftover processing merges into active
//!
//! At most one run is in flight; overlapping triggers are suppressed. A
//! per-driver failure is retried on the next run via merge-back, so once an
//! update is enqueued it is persisted at least once or still pending.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::durable::{DriverRepository, PositionUpdate};
use crate::ids::DriverId;
use crate::position::PositionStore;

/// Introspection surface for the admin API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub running: bool,
    pub cadence_active: bool,
}

/// Outcome counts for one completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub snapshot: usize,
    pub persisted: usize,
    pub failed: usize,
    pub expired: usize,
}

/// Result of asking for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRun {
    /// Another run was already in flight.
    Skipped,
    Completed(SyncReport),
}

/// Background worker migrating dirty positions to the durable store.
pub struct LocationSyncWorker {
    positions: Arc<PositionStore>,
    repo: Arc<dyn DriverRepository>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    running: AtomicBool,
    cadence_active: AtomicBool,
}

/// Clears the in-flight flag even if a persist future panics.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl LocationSyncWorker {
    pub fn new(
        positions: Arc<PositionStore>,
        repo: Arc<dyn DriverRepository>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            positions,
            repo,
            clock,
            interval,
            running: AtomicBool::new(false),
            cadence_active: AtomicBool::new(false),
        }
    }

    /// Runs the cadence until shutdown is signalled.
    ///
    /// Leftover processing entries from a crashed run are merged back before
    /// the first tick so nothing enqueued is ever silently lost.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let recovered = self.positions.recover_processing();
        if recovered > 0 {
            warn!(recovered, "merged orphaned processing entries back into active");
        }

        info!(
            interval_secs = self.interval.as_secs(),
            "location sync worker starting"
        );
        self.cadence_active.store(true, Ordering::SeqCst);

        let mut interval = tokio::time::interval(self.interval);
        // Skip the first immediate tick
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("location sync worker shutting down");
                    break;
                }

                _ = interval.tick() => {
                    self.run_once().await;
                }
            }
        }

        self.cadence_active.store(false, Ordering::SeqCst);
    }

    /// Admin-invoked run, bypassing the cadence but honouring the overlap
    /// lock.
    pub async fn trigger_now(&self) -> SyncRun {
        self.run_once().await
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            running: self.running.load(Ordering::SeqCst),
            cadence_active: self.cadence_active.load(Ordering::SeqCst),
        }
    }

    async fn run_once(&self) -> SyncRun {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("sync run already in flight, skipping");
            return SyncRun::Skipped;
        }
        let _guard = RunGuard(&self.running);

        // Phase 1: snapshot.
        let snapshot = self.positions.snapshot_dirty();
        if snapshot.is_empty() {
            return SyncRun::Completed(SyncReport::default());
        }

        // Phase 2: gather, dropping entries that expired since the snapshot.
        let mut updates: Vec<(DriverId, PositionUpdate)> = Vec::with_capacity(snapshot.len());
        let mut expired: Vec<DriverId> = Vec::new();
        for driver_id in &snapshot {
            match self.positions.get(*driver_id) {
                Some(record) => {
                    let last_seen_at = Utc
                        .timestamp_millis_opt(record.last_seen_ms as i64)
                        .single()
                        .unwrap_or_else(Utc::now);
                    updates.push((
                        *driver_id,
                        PositionUpdate {
                            coordinates: record.coordinates,
                            cell: u64::from(record.cell),
                            is_online: record.is_online,
                            is_available: record.is_available,
                            last_seen_at,
                        },
                    ));
                }
                None => expired.push(*driver_id),
            }
        }

        // Phase 3: persist, independent writes in parallel.
        let outcomes = join_all(updates.into_iter().map(|(driver_id, update)| async move {
            let result = self.repo.update_driver_position(driver_id, update).await;
            (driver_id, result)
        }))
        .await;

        // Phase 4: reconcile.
        let mut persisted: Vec<DriverId> = Vec::new();
        let mut failed: Vec<DriverId> = Vec::new();
        for (driver_id, result) in outcomes {
            match result {
                Ok(()) => persisted.push(driver_id),
                Err(e) => {
                    warn!(driver = %driver_id, error = %e, "durable position write failed");
                    failed.push(driver_id);
                }
            }
        }
        self.positions.complete_processing(&persisted);
        self.positions.complete_processing(&expired);
        self.positions.requeue_failed(&failed);

        let report = SyncReport {
            snapshot: snapshot.len(),
            persisted: persisted.len(),
            failed: failed.len(),
            expired: expired.len(),
        };
        info!(
            snapshot = report.snapshot,
            persisted = report.persisted,
            failed = report.failed,
            expired = report.expired,
            at_ms = self.clock.now_ms(),
            "sync run complete"
        );
        SyncRun::Completed(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::durable::{DurableDriver, InMemoryDriverRepository};
    use crate::ids::UserId;
    use crate::position::PositionWrite;
    use crate::spatial::cell_of;
    use async_trait::async_trait;
    use crate::error::Result as CoreResult;

    const TTL_MS: u64 = 300_000;

    struct Harness {
        clock: Arc<ManualClock>,
        positions: Arc<PositionStore>,
        repo: Arc<InMemoryDriverRepository>,
        worker: Arc<LocationSyncWorker>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(1_000));
        let positions = Arc::new(PositionStore::new(clock.clone(), TTL_MS));
        let repo = Arc::new(InMemoryDriverRepository::new());
        let worker = Arc::new(LocationSyncWorker::new(
            positions.clone(),
            repo.clone(),
            clock.clone(),
            Duration::from_secs(300),
        ));
        Harness {
            clock,
            positions,
            repo,
            worker,
        }
    }

    fn seed_driver(h: &Harness) -> DriverId {
        let driver_id = DriverId::new();
        let user_id = UserId::new();
        h.repo
            .insert(DurableDriver::new(driver_id, user_id, "Test Driver"));
        let cell = cell_of(52.52, 13.405).expect("cell");
        h.positions.upsert(PositionWrite {
            driver_id,
            user_id,
            coordinates: [13.405, 52.52],
            cell,
            is_online: true,
            is_available: true,
        });
        driver_id
    }

    #[tokio::test]
    async fn clean_run_persists_everything_and_empties_processing() {
        let h = harness();
        let d1 = seed_driver(&h);
        let d2 = seed_driver(&h);

        let run = h.worker.trigger_now().await;
        let SyncRun::Completed(report) = run else {
            panic!("run skipped");
        };
        assert_eq!(report.snapshot, 2);
        assert_eq!(report.persisted, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(h.positions.dirty_sizes(), (0, 0));

        for id in [d1, d2] {
            let driver = h.repo.get_driver(id).await.expect("get").expect("some");
            assert_eq!(driver.last_position, Some([13.405, 52.52]));
            assert!(driver.last_seen_at.is_some());
        }
    }

    #[tokio::test]
    async fn empty_dirty_set_is_a_noop() {
        let h = harness();
        let run = h.worker.trigger_now().await;
        assert_eq!(run, SyncRun::Completed(SyncReport::default()));
    }

    #[tokio::test]
    async fn failed_drivers_merge_back_and_persist_next_run() {
        let h = harness();
        let d1 = seed_driver(&h);
        let d2 = seed_driver(&h);
        let d3 = seed_driver(&h);
        h.repo.fail_position_updates_for(d2, true);

        let SyncRun::Completed(report) = h.worker.trigger_now().await else {
            panic!("run skipped");
        };
        assert_eq!(report.persisted, 2);
        assert_eq!(report.failed, 1);
        // Processing drained; the failure is active again.
        assert_eq!(h.positions.dirty_sizes(), (1, 0));
        assert!(h
            .repo
            .get_driver(d1)
            .await
            .expect("get")
            .expect("some")
            .last_seen_at
            .is_some());
        assert!(h
            .repo
            .get_driver(d3)
            .await
            .expect("get")
            .expect("some")
            .last_seen_at
            .is_some());

        h.repo.fail_position_updates_for(d2, false);
        let SyncRun::Completed(report) = h.worker.trigger_now().await else {
            panic!("run skipped");
        };
        assert_eq!(report.snapshot, 1);
        assert_eq!(report.persisted, 1);
        assert_eq!(h.positions.dirty_sizes(), (0, 0));
        assert!(h
            .repo
            .get_driver(d2)
            .await
            .expect("get")
            .expect("some")
            .last_seen_at
            .is_some());
    }

    #[tokio::test]
    async fn expired_records_are_dropped_not_persisted() {
        let h = harness();
        let driver_id = seed_driver(&h);

        h.clock.advance_ms(TTL_MS + 1);
        let SyncRun::Completed(report) = h.worker.trigger_now().await else {
            panic!("run skipped");
        };
        assert_eq!(report.snapshot, 1);
        assert_eq!(report.expired, 1);
        assert_eq!(report.persisted, 0);
        assert_eq!(h.positions.dirty_sizes(), (0, 0));
        assert!(h
            .repo
            .get_driver(driver_id)
            .await
            .expect("get")
            .expect("some")
            .last_seen_at
            .is_none());
    }

    /// Repository that parks position writes until released, to hold a sync
    /// run in flight.
    struct ParkedRepository {
        inner: InMemoryDriverRepository,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl DriverRepository for ParkedRepository {
        async fn get_driver(&self, driver_id: DriverId) -> CoreResult<Option<DurableDriver>> {
            self.inner.get_driver(driver_id).await
        }

        async fn find_by_user(&self, user_id: UserId) -> CoreResult<Option<DurableDriver>> {
            self.inner.find_by_user(user_id).await
        }

        async fn update_driver_position(
            &self,
            driver_id: DriverId,
            update: PositionUpdate,
        ) -> CoreResult<()> {
            self.release.notified().await;
            self.inner.update_driver_position(driver_id, update).await
        }

        async fn list_pending_verifications(&self) -> CoreResult<Vec<DurableDriver>> {
            self.inner.list_pending_verifications().await
        }

        async fn set_verified(&self, driver_id: DriverId, verified: bool) -> CoreResult<()> {
            self.inner.set_verified(driver_id, verified).await
        }

        async fn set_blocked(&self, driver_id: DriverId, blocked: bool) -> CoreResult<()> {
            self.inner.set_blocked(driver_id, blocked).await
        }
    }

    #[tokio::test]
    async fn overlapping_triggers_are_suppressed() {
        let clock = Arc::new(ManualClock::new(1_000));
        let positions = Arc::new(PositionStore::new(clock.clone(), TTL_MS));
        let repo = Arc::new(ParkedRepository {
            inner: InMemoryDriverRepository::new(),
            release: tokio::sync::Notify::new(),
        });

        let driver_id = DriverId::new();
        let user_id = UserId::new();
        repo.inner
            .insert(DurableDriver::new(driver_id, user_id, "Parked"));
        positions.upsert(PositionWrite {
            driver_id,
            user_id,
            coordinates: [13.405, 52.52],
            cell: cell_of(52.52, 13.405).expect("cell"),
            is_online: true,
            is_available: true,
        });

        let worker = Arc::new(LocationSyncWorker::new(
            positions,
            repo.clone(),
            clock,
            Duration::from_secs(300),
        ));

        let in_flight = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.trigger_now().await })
        };
        // Let the first run reach the parked persist phase.
        tokio::task::yield_now().await;
        assert!(worker.status().running);

        assert_eq!(worker.trigger_now().await, SyncRun::Skipped);

        repo.release.notify_waiters();
        let SyncRun::Completed(report) = in_flight.await.expect("join") else {
            panic!("first run skipped");
        };
        assert_eq!(report.persisted, 1);
        assert!(!worker.status().running);
    }

    #[tokio::test]
    async fn startup_recovers_orphaned_processing_entries() {
        let h = harness();
        seed_driver(&h);
        // Simulate a crash: snapshot taken, run never finished.
        h.positions.snapshot_dirty();
        assert_eq!(h.positions.dirty_sizes(), (0, 1));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(h.worker.clone().run(shutdown.clone()));
        tokio::task::yield_now().await;

        assert_eq!(h.positions.dirty_sizes(), (1, 0));
        shutdown.cancel();
        handle.await.expect("join");
    }
}
