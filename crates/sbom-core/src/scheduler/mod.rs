//! Worker scheduler: claims queued tasks and runs them in bounded slots.
//!
//! Each instance runs one [`Scheduler::run`] loop.  On every poll tick the
//! loop takes a free slot from the [`SlotPool`], asks the ledger for the
//! oldest queued task, and spawns its execution on a [`TaskTracker`].  The
//! slot permit travels with the execution and is released when it ends.
//!
//! Shutdown stops claiming immediately, then waits for in-flight
//! executions up to the grace period.  Executions still running after that
//! are aborted; their rows stay `running` and are left to the janitor.
//!
//! While a scanner runs, the result temp file's mtime is refreshed every
//! `temp_heartbeat` so the janitor's temp sweep never takes it for an
//! orphan.  Keep the heartbeat well below the janitor's `tmp_max_age`.

pub mod admission;
pub mod processor;


use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{ExecutionError, LedgerError};
use crate::ledger::TaskLedger;
use crate::storage::{BlobKind, BlobStore};
use crate::types::{Task, TaskId, TaskStatus};

use self::admission::{SlotPermit, SlotPool};
use self::processor::{sanitize_diagnostic, Processor};

/// Diagnostic recorded when a claimed task has no input blob.
pub const INPUT_MISSING: &str = "input missing";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of concurrent execution slots.
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight executions.
    pub shutdown_grace: Duration,
    /// Keep the input blob after a task completes successfully.
    pub keep_input_on_success: bool,
    /// How often a running execution refreshes its result temp file.
    pub temp_heartbeat: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(30),
            keep_input_on_success: false,
            temp_heartbeat: Duration::from_secs(60),
        }
    }
}

/// Outcome of a scheduler shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Every in-flight execution finished within the grace period.
    pub drained: bool,
    /// Executions aborted after the grace period expired.
    pub abandoned: usize,
}

/// Result of a single [`Scheduler::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// All slots were busy; nothing was claimed.
    NoSlot,
    /// The queue was empty.
    Idle,
    /// A task was claimed and its execution spawned.
    Spawned(TaskId),
}

struct Shared<L, P> {
    ledger: Arc<L>,
    blobs: BlobStore,
    processor: P,
    keep_input_on_success: bool,
    temp_heartbeat: Duration,
}

pub struct Scheduler<L, P> {
    shared: Arc<Shared<L, P>>,
    slots: SlotPool,
    tracker: TaskTracker,
    /// Fired only when the grace period expires; aborts executions.
    abort: CancellationToken,
    poll_interval: Duration,
    shutdown_grace: Duration,
}

impl<L: TaskLedger, P: Processor> Scheduler<L, P> {
    pub fn new(ledger: Arc<L>, blobs: BlobStore, processor: P, config: SchedulerConfig) -> Self {
        let concurrency = if config.concurrency == 0 {
            SchedulerConfig::default().concurrency
        } else {
            config.concurrency
        };
        let poll_interval = if config.poll_interval.is_zero() {
            SchedulerConfig::default().poll_interval
        } else {
            config.poll_interval
        };
        let temp_heartbeat = if config.temp_heartbeat.is_zero() {
            SchedulerConfig::default().temp_heartbeat
        } else {
            config.temp_heartbeat
        };
        Self {
            shared: Arc::new(Shared {
                ledger,
                blobs,
                processor,
                keep_input_on_success: config.keep_input_on_success,
                temp_heartbeat,
            }),
            slots: SlotPool::new(concurrency),
            tracker: TaskTracker::new(),
            abort: CancellationToken::new(),
            poll_interval,
            shutdown_grace: config.shutdown_grace,
        }
    }

    pub fn slots(&self) -> &SlotPool {
        &self.slots
    }

    /// Claim and spawn tasks until `shutdown` fires, then drain.
    pub async fn run(&self, shutdown: CancellationToken) -> DrainReport {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            concurrency = self.slots.capacity(),
            poll_ms = self.poll_interval.as_millis() as u64,
            "scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "claim failed");
                    }
                }
            }
        }

        self.drain().await
    }

    /// One claim attempt.
    ///
    /// A slot is taken before claiming so that a claimed task is never left
    /// waiting for capacity.
    pub async fn tick(&self) -> Result<TickOutcome, LedgerError> {
        let Some(permit) = self.slots.try_acquire() else {
            return Ok(TickOutcome::NoSlot);
        };
        let Some(task) = self.shared.ledger.claim_next_queued().await? else {
            return Ok(TickOutcome::Idle);
        };

        let id = task.id.clone();
        let span = info_span!("task", task_id = %id, attempt = task.attempts);
        let shared = Arc::clone(&self.shared);
        let abort = self.abort.clone();
        self.tracker
            .spawn(execute(shared, task, abort, permit).instrument(span));
        Ok(TickOutcome::Spawned(id))
    }

    async fn drain(&self) -> DrainReport {
        self.tracker.close();
        let in_flight = self.slots.in_use();
        if in_flight > 0 {
            info!(in_flight, grace_secs = self.shutdown_grace.as_secs(), "draining executions");
        }

        if tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_ok()
        {
            info!("scheduler drained");
            return DrainReport {
                drained: true,
                abandoned: 0,
            };
        }

        let abandoned = self.tracker.len();
        warn!(abandoned, "shutdown grace expired; aborting executions");
        self.abort.cancel();
        self.tracker.wait().await;
        DrainReport {
            drained: false,
            abandoned,
        }
    }
}

/// Run one claimed task to a terminal state.
///
/// The slot permit is held until this returns.
async fn execute<L: TaskLedger, P: Processor>(
    shared: Arc<Shared<L, P>>,
    task: Task,
    abort: CancellationToken,
    _permit: SlotPermit,
) {
    let id = task.id;
    let blobs = &shared.blobs;

    match blobs.exists(BlobKind::Input, &id).await {
        Ok(true) => {}
        Ok(false) => {
            warn!("input blob missing");
            record(&*shared.ledger, &id, TaskStatus::Failed, Some(INPUT_MISSING)).await;
            return;
        }
        Err(e) => {
            error!(error = %e, "cannot check input blob");
            let msg = sanitize_diagnostic(&e.to_string());
            record(&*shared.ledger, &id, TaskStatus::Failed, Some(&msg)).await;
            return;
        }
    }

    let input = blobs.path(BlobKind::Input, &id);
    let output = blobs.temp_path(BlobKind::Result, &id);
    debug!(input = %input.display(), "processing");

    let work = shared.processor.process(&input, &output, &abort);
    tokio::pin!(work);
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + shared.temp_heartbeat,
        shared.temp_heartbeat,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let outcome = loop {
        tokio::select! {
            outcome = &mut work => break outcome,
            _ = heartbeat.tick() => {
                if let Err(e) = blobs.touch_temp(BlobKind::Result, &id).await {
                    warn!(error = %e, "failed to refresh result temp file");
                }
            }
        }
    };

    let result = match outcome {
        Err(ExecutionError::Cancelled) => {
            discard_result_temp(blobs, &id).await;
            warn!("execution aborted by shutdown; leaving task running");
            return;
        }
        Err(e) => Err(e.to_string()),
        Ok(()) => blobs
            .publish(BlobKind::Result, &id)
            .await
            .map_err(|e| e.to_string()),
    };

    match result {
        Ok(()) => {
            if !record(&*shared.ledger, &id, TaskStatus::Done, None).await {
                // The row stays `running`; the reaper may still need the input.
                warn!("result published but not recorded; input kept");
                return;
            }
            if !shared.keep_input_on_success {
                if let Err(e) = blobs.remove(BlobKind::Input, &id).await {
                    warn!(error = %e, "failed to remove input blob");
                }
            }
            info!("task done");
        }
        Err(msg) => {
            discard_result_temp(blobs, &id).await;
            let msg = sanitize_diagnostic(&msg);
            warn!(error = %msg, "task failed");
            record(&*shared.ledger, &id, TaskStatus::Failed, Some(&msg)).await;
        }
    }
}

/// Write the task's status; `false` when the ledger rejected the write.
async fn record<L: TaskLedger>(
    ledger: &L,
    id: &TaskId,
    status: TaskStatus,
    error: Option<&str>,
) -> bool {
    match ledger.set_status(id, status, error).await {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, %status, "failed to record task status");
            false
        }
    }
}

async fn discard_result_temp(blobs: &BlobStore, id: &TaskId) {
    if let Err(e) = blobs.remove_temp(BlobKind::Result, id).await {
        warn!(error = %e, "failed to remove result temp file");
    }
}
