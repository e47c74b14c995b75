//! Durable archive-scan task queue.
//!
//! Tasks live in a shared [`ledger`]; their input and result files live in a
//! shared [`storage`] directory.  Each instance runs a [`scheduler`] that
//! claims and executes queued tasks and a [`janitor`] that keeps the shared
//! state tidy.

pub mod error;
pub mod janitor;
pub mod ledger;
pub mod scheduler;
pub mod storage;
pub mod types;

pub use error::{BlobError, ExecutionError, LedgerError, TaskIdError};
pub use janitor::{CycleReport, Janitor, JanitorConfig};
pub use ledger::postgres::PgLedger;
pub use ledger::{ClusterLock, TaskLedger};
pub use scheduler::processor::{CommandProcessor, Processor};
pub use scheduler::{DrainReport, Scheduler, SchedulerConfig};
pub use storage::{BlobKind, BlobStore};
pub use types::{RunningTimeoutAction, StatusCounts, Task, TaskId, TaskStatus};

#[cfg(feature = "memory")]
pub use ledger::memory::MemoryLedger;
