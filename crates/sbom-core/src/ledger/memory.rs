//! In-process ledger with the same claim and lock semantics as Postgres.
//!
//! Intended for tests and single-node experiments: state lives behind one
//! `tokio::sync::Mutex`, which makes every operation trivially atomic.  It
//! also exposes a few knobs (backdating, injected failures) that tests use
//! to reach states that are otherwise only reachable with wall-clock time
//! or a flaky database.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{exhausted_message, ClusterLock, TaskLedger, REAPED_FAIL_MESSAGE};
use crate::error::LedgerError;
use crate::types::{RunningTimeoutAction, StatusCounts, Task, TaskId, TaskStatus};

#[derive(Debug)]
struct Entry {
    task: Task,
    /// Insertion order; breaks timestamp ties.
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<TaskId, Entry>,
    next_seq: u64,
    failing_claims: usize,
    failing_status_writes: usize,
    failing_deletes: HashSet<TaskId>,
}

/// In-memory [`TaskLedger`] and [`ClusterLock`].
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    inner: Arc<Mutex<Inner>>,
    held_keys: Arc<StdMutex<HashSet<i64>>>,
}

fn before(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| t.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn since(d: Duration) -> DateTime<Utc> {
    before(Utc::now(), d)
}

fn injected() -> LedgerError {
    LedgerError::Store(sqlx::Error::PoolTimedOut)
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a task's last-transition time `by` into the past.
    pub async fn backdate(&self, id: &TaskId, by: Duration) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| LedgerError::NotFound(id.clone()))?;
        entry.task.timestamp = before(entry.task.timestamp, by);
        Ok(())
    }

    /// Make the next `n` claims fail with a store error.
    pub async fn fail_next_claims(&self, n: usize) {
        self.inner.lock().await.failing_claims = n;
    }

    /// Make the next `n` status writes fail with a store error.
    pub async fn fail_next_set_status(&self, n: usize) {
        self.inner.lock().await.failing_status_writes = n;
    }

    /// Make every delete of `id` fail with a store error.
    pub async fn fail_deletes_of(&self, id: &TaskId) {
        self.inner.lock().await.failing_deletes.insert(id.clone());
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl TaskLedger for MemoryLedger {
    async fn enqueue(&self, id: &TaskId) -> Result<Task, LedgerError> {
        let mut inner = self.inner.lock().await;
        if inner.entries.contains_key(id) {
            return Err(LedgerError::DuplicateId(id.clone()));
        }
        let task = Task {
            id: id.clone(),
            status: TaskStatus::Queued,
            timestamp: Utc::now(),
            error: None,
            attempts: 0,
        };
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            id.clone(),
            Entry {
                task: task.clone(),
                seq,
            },
        );
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> Result<Task, LedgerError> {
        self.inner
            .lock()
            .await
            .entries
            .get(id)
            .map(|e| e.task.clone())
            .ok_or_else(|| LedgerError::NotFound(id.clone()))
    }

    async fn claim_next_queued(&self) -> Result<Option<Task>, LedgerError> {
        let mut inner = self.inner.lock().await;
        if inner.failing_claims > 0 {
            inner.failing_claims -= 1;
            return Err(injected());
        }
        let Some(entry) = inner
            .entries
            .values_mut()
            .filter(|e| e.task.status == TaskStatus::Queued)
            .min_by_key(|e| (e.task.timestamp, e.seq))
        else {
            return Ok(None);
        };
        entry.task.status = TaskStatus::Running;
        entry.task.timestamp = Utc::now();
        entry.task.error = None;
        entry.task.attempts += 1;
        Ok(Some(entry.task.clone()))
    }

    async fn set_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        if inner.failing_status_writes > 0 {
            inner.failing_status_writes -= 1;
            return Err(injected());
        }
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| LedgerError::NotFound(id.clone()))?;
        entry.task.status = status;
        entry.task.timestamp = Utc::now();
        entry.task.error = error.map(str::to_owned);
        Ok(())
    }

    async fn reap_stuck_running(
        &self,
        older_than: Duration,
        action: RunningTimeoutAction,
        max_attempts: u32,
    ) -> Result<u64, LedgerError> {
        let cutoff = since(older_than);
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let mut reaped = 0;
        for entry in inner.entries.values_mut() {
            let task = &mut entry.task;
            if task.status != TaskStatus::Running || task.timestamp >= cutoff {
                continue;
            }
            let requeue = action == RunningTimeoutAction::Requeue
                && i64::from(task.attempts) < i64::from(max_attempts);
            if requeue {
                task.status = TaskStatus::Queued;
                task.error = None;
            } else {
                task.status = TaskStatus::Failed;
                task.error = Some(match action {
                    RunningTimeoutAction::Fail => REAPED_FAIL_MESSAGE.to_owned(),
                    RunningTimeoutAction::Requeue => exhausted_message(task.attempts),
                });
            }
            task.timestamp = now;
            reaped += 1;
        }
        Ok(reaped)
    }

    async fn list_expired(&self, older_than: Duration, limit: usize) -> Result<Vec<Task>, LedgerError> {
        let cutoff = since(older_than);
        let inner = self.inner.lock().await;
        let mut expired: Vec<&Entry> = inner
            .entries
            .values()
            .filter(|e| e.task.status.is_terminal() && e.task.timestamp < cutoff)
            .collect();
        expired.sort_by_key(|e| (e.task.timestamp, e.seq));
        Ok(expired
            .into_iter()
            .take(limit)
            .map(|e| e.task.clone())
            .collect())
    }

    async fn delete(&self, id: &TaskId) -> Result<bool, LedgerError> {
        let mut inner = self.inner.lock().await;
        if inner.failing_deletes.contains(id) {
            return Err(injected());
        }
        Ok(inner.entries.remove(id).is_some())
    }

    async fn status_counts(&self) -> Result<StatusCounts, LedgerError> {
        let inner = self.inner.lock().await;
        let mut counts = StatusCounts::default();
        for entry in inner.entries.values() {
            counts.add(entry.task.status, 1);
        }
        Ok(counts)
    }
}

/// Holding a key of the in-process lock table.
#[derive(Debug)]
pub struct MemoryLease {
    key: i64,
    held: Arc<StdMutex<HashSet<i64>>>,
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.key);
        }
    }
}

impl ClusterLock for MemoryLedger {
    type Lease = MemoryLease;

    async fn try_lock(&self, key: i64) -> Result<Option<MemoryLease>, LedgerError> {
        let mut held = self.held_keys.lock().unwrap_or_else(|p| p.into_inner());
        if !held.insert(key) {
            return Ok(None);
        }
        Ok(Some(MemoryLease {
            key,
            held: Arc::clone(&self.held_keys),
        }))
    }

    async fn unlock(&self, lease: MemoryLease) -> Result<(), LedgerError> {
        drop(lease);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    fn id(s: &str) -> TaskId {
        TaskId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_get_is_queued_without_error() {
        let ledger = MemoryLedger::new();
        ledger.enqueue(&id("a")).await.unwrap();

        let task = ledger.get(&id("a")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.error, None);
        assert_eq!(task.attempts, 0);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected() {
        let ledger = MemoryLedger::new();
        ledger.enqueue(&id("a")).await.unwrap();
        let err = ledger.enqueue(&id("a")).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateId(_)));
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let ledger = MemoryLedger::new();
        assert!(matches!(
            ledger.get(&id("ghost")).await,
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            ledger.set_status(&id("ghost"), TaskStatus::Done, None).await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn claims_oldest_first_and_returns_none_when_drained() {
        let ledger = MemoryLedger::new();
        for name in ["first", "second", "third"] {
            ledger.enqueue(&id(name)).await.unwrap();
        }
        ledger.backdate(&id("third"), Duration::from_secs(60)).await.unwrap();

        let order: Vec<String> = [
            ledger.claim_next_queued().await.unwrap(),
            ledger.claim_next_queued().await.unwrap(),
            ledger.claim_next_queued().await.unwrap(),
        ]
        .into_iter()
        .map(|t| t.expect("task available").id.to_string())
        .collect();

        assert_eq!(order, ["third", "first", "second"]);
        assert!(ledger.claim_next_queued().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_marks_running_and_counts_attempts() {
        let ledger = MemoryLedger::new();
        ledger.enqueue(&id("a")).await.unwrap();
        let claimed = ledger.claim_next_queued().await.unwrap().unwrap();

        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(ledger.get(&id("a")).await.unwrap().status, TaskStatus::Running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimants_each_task_exactly_once() {
        let ledger = MemoryLedger::new();
        let mut enqueued = HashSet::new();
        for _ in 0..200 {
            let id = TaskId::generate();
            ledger.enqueue(&id).await.unwrap();
            enqueued.insert(id);
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(task) = ledger.claim_next_queued().await.unwrap() {
                    mine.push(task.id);
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "task claimed twice");
            }
        }
        assert_eq!(seen, enqueued);
    }

    #[tokio::test]
    async fn injected_status_write_failure_leaves_row_untouched() {
        let ledger = MemoryLedger::new();
        ledger.enqueue(&id("a")).await.unwrap();
        ledger.claim_next_queued().await.unwrap();
        ledger.fail_next_set_status(1).await;

        let err = ledger.set_status(&id("a"), TaskStatus::Done, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::Store(_)));
        assert_eq!(ledger.get(&id("a")).await.unwrap().status, TaskStatus::Running);

        ledger.set_status(&id("a"), TaskStatus::Done, None).await.unwrap();
        assert_eq!(ledger.get(&id("a")).await.unwrap().status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn reaping_is_idempotent() {
        let ledger = MemoryLedger::new();
        ledger.enqueue(&id("stuck")).await.unwrap();
        ledger.claim_next_queued().await.unwrap();
        ledger.backdate(&id("stuck"), Duration::from_secs(4 * 3600)).await.unwrap();

        let timeout = Duration::from_secs(3 * 3600);
        let first = ledger
            .reap_stuck_running(timeout, RunningTimeoutAction::Fail, 3)
            .await
            .unwrap();
        let second = ledger
            .reap_stuck_running(timeout, RunningTimeoutAction::Fail, 3)
            .await
            .unwrap();

        assert_eq!((first, second), (1, 0));
        let task = ledger.get(&id("stuck")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some(REAPED_FAIL_MESSAGE));
    }

    #[tokio::test]
    async fn requeue_is_bounded_by_attempts() {
        let ledger = MemoryLedger::new();
        let task = id("flaky");
        ledger.enqueue(&task).await.unwrap();

        for round in 1..=2 {
            ledger.claim_next_queued().await.unwrap().unwrap();
            ledger.backdate(&task, Duration::from_secs(600)).await.unwrap();
            let reaped = ledger
                .reap_stuck_running(Duration::from_secs(60), RunningTimeoutAction::Requeue, 2)
                .await
                .unwrap();
            assert_eq!(reaped, 1);
            let row = ledger.get(&task).await.unwrap();
            if round < 2 {
                assert_eq!(row.status, TaskStatus::Queued);
                assert_eq!(row.error, None);
            } else {
                assert_eq!(row.status, TaskStatus::Failed);
                assert_eq!(row.error, Some(exhausted_message(2)));
            }
        }
    }

    #[tokio::test]
    async fn fresh_running_tasks_are_not_reaped() {
        let ledger = MemoryLedger::new();
        ledger.enqueue(&id("busy")).await.unwrap();
        ledger.claim_next_queued().await.unwrap();
        let reaped = ledger
            .reap_stuck_running(Duration::from_secs(60), RunningTimeoutAction::Fail, 3)
            .await
            .unwrap();
        assert_eq!(reaped, 0);
    }

    #[tokio::test]
    async fn list_expired_returns_only_old_terminal_rows_oldest_first() {
        let ledger = MemoryLedger::new();
        for name in ["done-old", "failed-older", "done-new", "queued-old"] {
            ledger.enqueue(&id(name)).await.unwrap();
        }
        ledger.set_status(&id("done-old"), TaskStatus::Done, None).await.unwrap();
        ledger
            .set_status(&id("failed-older"), TaskStatus::Failed, Some("boom"))
            .await
            .unwrap();
        ledger.set_status(&id("done-new"), TaskStatus::Done, None).await.unwrap();
        ledger.backdate(&id("done-old"), Duration::from_secs(7200)).await.unwrap();
        ledger.backdate(&id("failed-older"), Duration::from_secs(9000)).await.unwrap();
        ledger.backdate(&id("queued-old"), Duration::from_secs(9000)).await.unwrap();

        let expired = ledger
            .list_expired(Duration::from_secs(3600), 10)
            .await
            .unwrap();
        let names: Vec<_> = expired.iter().map(|t| t.id.to_string()).collect();
        assert_eq!(names, ["failed-older", "done-old"]);

        let capped = ledger.list_expired(Duration::from_secs(3600), 1).await.unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released_or_dropped() {
        let ledger = Arc::new(MemoryLedger::new());
        let lease = ledger.try_lock(7).await.unwrap().expect("free key");
        assert!(ledger.try_lock(7).await.unwrap().is_none());
        assert!(ledger.try_lock(8).await.unwrap().is_some());

        ledger.unlock(lease).await.unwrap();
        let lease = ledger.try_lock(7).await.unwrap().expect("released key");
        drop(lease);
        assert!(ledger.try_lock(7).await.unwrap().is_some());
    }
}
