//! Task ledger: the authoritative state of every task.
//!
//! [`TaskLedger`] is the narrow interface every other component goes
//! through; all cross-process coordination on task state happens behind it.
//! The production implementation is [`postgres::PgLedger`]; an in-process
//! [`memory::MemoryLedger`] backs tests.
//!
//! [`ClusterLock`] provides the non-blocking, cluster-wide mutual exclusion
//! used to elect one janitor per maintenance cycle.
//!
//! All trait methods use `impl Future` in their signatures so no extra
//! `async-trait` crate is required.

pub mod postgres;

#[cfg(any(test, feature = "memory"))]
pub mod memory;

use std::future::Future;
use std::time::Duration;

use crate::error::LedgerError;
use crate::types::{RunningTimeoutAction, StatusCounts, Task, TaskId, TaskStatus};

/// Diagnostic written by the reaper when it fails a stuck task.
pub const REAPED_FAIL_MESSAGE: &str = "failed by janitor: running too long";

/// Persistent store of task rows.
pub trait TaskLedger: Send + Sync + 'static {
    /// Insert a new `queued` row.
    ///
    /// Fails with [`LedgerError::DuplicateId`] if the id already exists.
    fn enqueue(&self, id: &TaskId) -> impl Future<Output = Result<Task, LedgerError>> + Send;

    /// Point lookup; [`LedgerError::NotFound`] when absent.
    fn get(&self, id: &TaskId) -> impl Future<Output = Result<Task, LedgerError>> + Send;

    /// Atomically move the oldest unlocked `queued` row to `running`.
    ///
    /// Returns `Ok(None)` when nothing is available.  Each row is handed to
    /// at most one caller, across any number of processes.
    fn claim_next_queued(&self) -> impl Future<Output = Result<Option<Task>, LedgerError>> + Send;

    /// Unconditionally record `status` and `error` for `id`.
    fn set_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        error: Option<&str>,
    ) -> impl Future<Output = Result<(), LedgerError>> + Send;

    /// Force every `running` row older than `older_than` to `failed` or back
    /// to `queued`.  Requeue falls back to `failed` once a task has been
    /// claimed `max_attempts` times.  Returns the number of rows changed.
    ///
    /// Filtered on `status = 'running'`, so re-running it is a no-op.
    fn reap_stuck_running(
        &self,
        older_than: Duration,
        action: RunningTimeoutAction,
        max_attempts: u32,
    ) -> impl Future<Output = Result<u64, LedgerError>> + Send;

    /// Terminal rows older than `older_than`, oldest first, at most `limit`.
    fn list_expired(
        &self,
        older_than: Duration,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Task>, LedgerError>> + Send;

    /// Delete a row; `Ok(false)` if it was already gone.
    fn delete(&self, id: &TaskId) -> impl Future<Output = Result<bool, LedgerError>> + Send;

    fn status_counts(&self) -> impl Future<Output = Result<StatusCounts, LedgerError>> + Send;
}

/// Cluster-wide, non-blocking mutual exclusion keyed by an integer.
pub trait ClusterLock: Send + Sync + 'static {
    /// Proof of holding a key.  Dropping it without [`ClusterLock::unlock`]
    /// must still release the key eventually.
    type Lease: Send;

    /// Try to take `key`; `Ok(None)` if another holder has it.
    fn try_lock(&self, key: i64) -> impl Future<Output = Result<Option<Self::Lease>, LedgerError>> + Send;

    fn unlock(&self, lease: Self::Lease) -> impl Future<Output = Result<(), LedgerError>> + Send;
}

pub(crate) fn exhausted_message(attempts: i32) -> String {
    format!("{REAPED_FAIL_MESSAGE} after {attempts} attempts")
}
