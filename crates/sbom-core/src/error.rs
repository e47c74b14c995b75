use std::path::PathBuf;

use thiserror::Error;

use crate::types::TaskId;

/// Errors produced by the task ledger.
///
/// Store errors are surfaced unmodified; nothing in the ledger retries.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// No row exists for the id.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// Enqueue collided with an existing row.
    #[error("duplicate task id: {0}")]
    DuplicateId(TaskId),

    /// Connectivity or transaction failure in the backing store.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Applying the embedded migrations failed.
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A row carried a value outside the closed domain of its column.
    #[error("corrupt row for task {id}: unexpected value {value:?}")]
    CorruptRow { id: String, value: String },
}

/// Errors from the durable file store.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("blob I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BlobError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            BlobError::NotFound { path }
        } else {
            BlobError::Io { path, source }
        }
    }
}

/// Failures of the external processing step.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The processor executable could not be started.
    #[error("failed to start processor: {0}")]
    Spawn(#[source] std::io::Error),

    /// I/O on the processor's input, output or pipes failed.
    #[error("processor I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The processor ran and reported failure.
    #[error("processor exited with {}: {stderr}", exit_label(.code))]
    NonZeroExit { code: Option<i32>, stderr: String },

    /// Execution was aborted by shutdown.
    #[error("processing cancelled")]
    Cancelled,
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "signal".to_owned(),
    }
}

/// Rejection reasons for [`TaskId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskIdError {
    #[error("task id is empty")]
    Empty,

    #[error("task id is too long ({len} bytes)")]
    TooLong { len: usize },

    #[error("task id contains invalid character {0:?}")]
    InvalidChar(char),
}
