//! Periodic maintenance: stuck-task reaping, retention and temp-file GC.
//!
//! Every instance runs a janitor loop, but each cycle first takes a
//! cluster-wide lock and is skipped when another instance holds it, so at
//! most one instance performs maintenance at a time.  The lock is held for
//! one cycle only.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ledger::{ClusterLock, TaskLedger};
use crate::storage::{BlobKind, BlobStore};
use crate::types::RunningTimeoutAction;

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Cycle interval.
    pub every: Duration,
    /// Age after which terminal tasks and their blobs are deleted.  Zero
    /// disables retention.
    pub retention: Duration,
    /// Age after which a `running` task counts as stuck.  Zero disables
    /// reaping.
    pub running_timeout: Duration,
    pub running_timeout_action: RunningTimeoutAction,
    /// Claims after which a stuck task is failed instead of requeued.
    pub max_attempts: u32,
    /// Age after which an orphaned temp file is removed.
    pub tmp_max_age: Duration,
    /// Upper bound on tasks removed by one retention pass.
    pub batch_size: usize,
    /// Cluster lock key; must be identical on every instance.
    pub lock_key: i64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            every: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 3600),
            running_timeout: Duration::from_secs(30 * 60),
            running_timeout_action: RunningTimeoutAction::Fail,
            max_attempts: 3,
            tmp_max_age: Duration::from_secs(10 * 60),
            batch_size: 500,
            lock_key: 9_876_543,
        }
    }
}

impl JanitorConfig {
    /// Replace zero interval, temp age and batch size with the defaults.
    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.every.is_zero() {
            self.every = defaults.every;
        }
        if self.tmp_max_age.is_zero() {
            self.tmp_max_age = defaults.tmp_max_age;
        }
        if self.batch_size == 0 {
            self.batch_size = defaults.batch_size;
        }
        self
    }
}

/// What one maintenance cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Another instance held the lock, or it could not be taken.
    pub skipped: bool,
    /// Stuck `running` tasks failed or requeued.
    pub reaped: u64,
    /// Expired tasks whose rows were deleted.
    pub purged: usize,
    /// Expired tasks whose blob cleanup or row delete failed.
    pub purge_failures: usize,
    /// Orphaned temp files removed.
    pub temp_removed: usize,
}

pub struct Janitor<L> {
    ledger: Arc<L>,
    blobs: BlobStore,
    config: JanitorConfig,
}

impl<L: TaskLedger + ClusterLock> Janitor<L> {
    pub fn new(ledger: Arc<L>, blobs: BlobStore, config: JanitorConfig) -> Self {
        Self {
            ledger,
            blobs,
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &JanitorConfig {
        &self.config
    }

    /// Run a cycle now and then on every interval tick until `shutdown`.
    ///
    /// A cycle in progress is finished before returning.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            every_secs = self.config.every.as_secs(),
            action = %self.config.running_timeout_action,
            "janitor started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.run_once().await;
                    if !report.skipped {
                        debug!(?report, "janitor cycle finished");
                    }
                }
            }
        }
        info!("janitor stopped");
    }

    /// One maintenance cycle under the cluster lock.
    pub async fn run_once(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let lease = match self.ledger.try_lock(self.config.lock_key).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!("maintenance lock held elsewhere; skipping cycle");
                report.skipped = true;
                return report;
            }
            Err(e) => {
                warn!(error = %e, "failed to take maintenance lock");
                report.skipped = true;
                return report;
            }
        };

        if !self.config.running_timeout.is_zero() {
            report.reaped = self.reap().await;
        }
        if !self.config.retention.is_zero() {
            let (purged, failures) = self.sweep_expired().await;
            report.purged = purged;
            report.purge_failures = failures;
        }
        report.temp_removed = self.sweep_temp().await;

        if let Err(e) = self.ledger.unlock(lease).await {
            warn!(error = %e, "failed to release maintenance lock");
        }
        report
    }

    async fn reap(&self) -> u64 {
        match self
            .ledger
            .reap_stuck_running(
                self.config.running_timeout,
                self.config.running_timeout_action,
                self.config.max_attempts,
            )
            .await
        {
            Ok(0) => 0,
            Ok(n) => {
                warn!(
                    count = n,
                    action = %self.config.running_timeout_action,
                    "reaped stuck running tasks"
                );
                n
            }
            Err(e) => {
                error!(error = %e, "stuck-task reaper failed");
                0
            }
        }
    }

    /// Delete one batch of expired tasks, blobs first.
    async fn sweep_expired(&self) -> (usize, usize) {
        let expired = match self
            .ledger
            .list_expired(self.config.retention, self.config.batch_size)
            .await
        {
            Ok(expired) => expired,
            Err(e) => {
                error!(error = %e, "listing expired tasks failed");
                return (0, 0);
            }
        };

        let mut purged = 0;
        let mut failures = 0;
        for task in expired {
            // Blob errors are counted; the row goes regardless.
            if let Err(e) = self.blobs.purge(&task.id).await {
                warn!(task_id = %task.id, error = %e, "blob cleanup failed");
                failures += 1;
            }
            match self.ledger.delete(&task.id).await {
                Ok(_) => purged += 1,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "deleting expired task failed");
                    failures += 1;
                }
            }
        }
        if purged > 0 {
            info!(purged, failures, "expired tasks removed");
        }
        (purged, failures)
    }

    async fn sweep_temp(&self) -> usize {
        let mut removed = 0;
        for kind in BlobKind::ALL {
            match self.blobs.sweep_temp(kind, self.config.tmp_max_age).await {
                Ok(n) => removed += n,
                Err(e) => warn!(?kind, error = %e, "temp sweep failed"),
            }
        }
        if removed > 0 {
            info!(removed, "orphaned temp files removed");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use tracing_test::traced_test;

    use super::*;
    use crate::ledger::memory::MemoryLedger;
    use crate::ledger::REAPED_FAIL_MESSAGE;
    use crate::types::{TaskId, TaskStatus};

    const HOUR: Duration = Duration::from_secs(3600);

    struct Fixture {
        _dir: tempfile::TempDir,
        ledger: Arc<MemoryLedger>,
        blobs: BlobStore,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::new(dir.path());
        blobs.ensure().await.unwrap();
        Fixture {
            _dir: dir,
            ledger: Arc::new(MemoryLedger::new()),
            blobs,
        }
    }

    impl Fixture {
        fn janitor(&self, config: JanitorConfig) -> Janitor<MemoryLedger> {
            Janitor::new(Arc::clone(&self.ledger), self.blobs.clone(), config)
        }

        async fn running(&self, name: &str, age: Duration) -> TaskId {
            let id = TaskId::parse(name).unwrap();
            self.ledger.enqueue(&id).await.unwrap();
            let claimed = self.ledger.claim_next_queued().await.unwrap().unwrap();
            assert_eq!(claimed.id, id);
            self.ledger.backdate(&id, age).await.unwrap();
            id
        }

        async fn finished(&self, name: &str, age: Duration) -> TaskId {
            let id = TaskId::parse(name).unwrap();
            self.ledger.enqueue(&id).await.unwrap();
            self.ledger.set_status(&id, TaskStatus::Done, None).await.unwrap();
            self.blobs.save_bytes(BlobKind::Input, &id, b"zip").await.unwrap();
            self.blobs.save_bytes(BlobKind::Result, &id, b"{}").await.unwrap();
            self.ledger.backdate(&id, age).await.unwrap();
            id
        }
    }

    #[tokio::test]
    async fn stuck_task_is_failed_once() {
        let fx = fixture().await;
        let id = fx.running("b", 4 * HOUR).await;
        let janitor = fx.janitor(JanitorConfig {
            running_timeout: 3 * HOUR,
            ..Default::default()
        });

        let first = janitor.run_once().await;
        assert_eq!(first.reaped, 1);
        let task = fx.ledger.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some(REAPED_FAIL_MESSAGE));

        let second = janitor.run_once().await;
        assert_eq!(second.reaped, 0);
        assert_eq!(fx.ledger.get(&id).await.unwrap(), task);
    }

    #[tokio::test]
    async fn requeue_puts_stuck_task_back_in_the_queue() {
        let fx = fixture().await;
        let id = fx.running("retry", 2 * HOUR).await;
        let janitor = fx.janitor(JanitorConfig {
            running_timeout: HOUR,
            running_timeout_action: RunningTimeoutAction::Requeue,
            max_attempts: 3,
            ..Default::default()
        });

        assert_eq!(janitor.run_once().await.reaped, 1);
        let task = fx.ledger.get(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.error, None);
    }

    #[tokio::test]
    async fn zero_running_timeout_disables_reaping() {
        let fx = fixture().await;
        let id = fx.running("old", 48 * HOUR).await;
        let janitor = fx.janitor(JanitorConfig {
            running_timeout: Duration::ZERO,
            ..Default::default()
        });

        assert_eq!(janitor.run_once().await.reaped, 0);
        assert_eq!(fx.ledger.get(&id).await.unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn expired_tasks_lose_rows_and_blobs() {
        let fx = fixture().await;
        let old = fx.finished("old", 48 * HOUR).await;
        let fresh = fx.finished("fresh", HOUR).await;
        let janitor = fx.janitor(JanitorConfig::default());

        let report = janitor.run_once().await;
        assert_eq!((report.purged, report.purge_failures), (1, 0));
        assert!(fx.ledger.get(&old).await.is_err());
        for kind in BlobKind::ALL {
            assert!(!fx.blobs.exists(kind, &old).await.unwrap());
            assert!(fx.blobs.exists(kind, &fresh).await.unwrap());
        }

        assert_eq!(janitor.run_once().await.purged, 0);
    }

    #[tokio::test]
    async fn retention_is_capped_per_cycle() {
        let fx = fixture().await;
        for i in 0..5 {
            fx.finished(&format!("t{i}"), 48 * HOUR).await;
        }
        let janitor = fx.janitor(JanitorConfig {
            batch_size: 2,
            ..Default::default()
        });

        assert_eq!(janitor.run_once().await.purged, 2);
        assert_eq!(fx.ledger.len().await, 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_delete_does_not_abort_the_batch() {
        let fx = fixture().await;
        let stuck = fx.finished("stuck", 50 * HOUR).await;
        fx.finished("other", 48 * HOUR).await;
        fx.ledger.fail_deletes_of(&stuck).await;
        let janitor = fx.janitor(JanitorConfig::default());

        let report = janitor.run_once().await;
        assert_eq!((report.purged, report.purge_failures), (1, 1));
        assert!(fx.ledger.get(&stuck).await.is_ok());
        assert!(logs_contain("deleting expired task failed"));
    }

    #[tokio::test]
    async fn old_temp_files_are_swept() {
        let fx = fixture().await;
        let id = TaskId::parse("crashed").unwrap();
        let old_tmp = fx.blobs.temp_path(BlobKind::Result, &id);
        let new_tmp = fx.blobs.temp_path(BlobKind::Input, &TaskId::parse("writing").unwrap());
        for path in [&old_tmp, &new_tmp] {
            std::fs::write(path, b"partial").unwrap();
        }
        let file = std::fs::File::options().write(true).open(&old_tmp).unwrap();
        file.set_modified(SystemTime::now() - HOUR).unwrap();

        let report = fx.janitor(JanitorConfig::default()).run_once().await;
        assert_eq!(report.temp_removed, 1);
        assert!(!old_tmp.exists());
        assert!(new_tmp.exists());
    }

    #[tokio::test]
    async fn cycle_is_skipped_while_another_instance_holds_the_lock() {
        let fx = fixture().await;
        let id = fx.running("b", 4 * HOUR).await;
        let config = JanitorConfig {
            running_timeout: HOUR,
            ..Default::default()
        };
        let janitor = fx.janitor(config.clone());

        let lease = fx.ledger.try_lock(config.lock_key).await.unwrap().unwrap();
        let report = janitor.run_once().await;
        assert!(report.skipped);
        assert_eq!(fx.ledger.get(&id).await.unwrap().status, TaskStatus::Running);

        fx.ledger.unlock(lease).await.unwrap();
        assert_eq!(janitor.run_once().await.reaped, 1);
    }

    #[tokio::test]
    async fn lock_is_released_after_each_cycle() {
        let fx = fixture().await;
        let janitor = fx.janitor(JanitorConfig::default());
        janitor.run_once().await;
        assert!(fx
            .ledger
            .try_lock(janitor.config().lock_key)
            .await
            .unwrap()
            .is_some());
    }

    #[test]
    fn zero_values_fall_back_to_defaults() {
        let cfg = JanitorConfig {
            every: Duration::ZERO,
            tmp_max_age: Duration::ZERO,
            batch_size: 0,
            retention: Duration::ZERO,
            ..Default::default()
        }
        .normalized();
        let defaults = JanitorConfig::default();
        assert_eq!(cfg.every, defaults.every);
        assert_eq!(cfg.tmp_max_age, defaults.tmp_max_age);
        assert_eq!(cfg.batch_size, defaults.batch_size);
        assert_eq!(cfg.retention, Duration::ZERO);
    }

    #[tokio::test]
    async fn run_cycles_immediately_and_stops_on_shutdown() {
        let fx = fixture().await;
        let id = fx.running("b", 4 * HOUR).await;
        let janitor = Arc::new(fx.janitor(JanitorConfig {
            every: HOUR,
            running_timeout: HOUR,
            ..Default::default()
        }));

        let shutdown = CancellationToken::new();
        let handle = {
            let janitor = Arc::clone(&janitor);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { janitor.run(shutdown).await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while fx.ledger.get(&id).await.unwrap().status != TaskStatus::Failed {
            assert!(tokio::time::Instant::now() < deadline, "first cycle never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();
    }
}
