//! Durable file store for per-task blobs.
//!
//! Every task owns at most two blobs, an uploaded input archive and the
//! scanner's result document.  Both are named from the task id alone:
//!
//! ```text
//! <base>/zips/zip-<id>.zip          <base>/zips/zip-<id>.zip.tmp
//! <base>/results/result-<id>.json   <base>/results/result-<id>.json.tmp
//! ```
//!
//! Writers always fill the `.tmp` sibling and rename it onto the final name,
//! so a reader of the final path observes either nothing or a complete file.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::BlobError;
use crate::types::TaskId;

/// Suffix of in-progress writes.
pub const TEMP_SUFFIX: &str = ".tmp";

/// The two blob kinds a task can own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKind {
    /// Uploaded archive; consumed by the scheduler.
    Input,
    /// Scanner output; served once the task is `done`.
    Result,
}

impl BlobKind {
    pub const ALL: [BlobKind; 2] = [BlobKind::Input, BlobKind::Result];

    fn dir_name(self) -> &'static str {
        match self {
            BlobKind::Input => "zips",
            BlobKind::Result => "results",
        }
    }

    fn file_name(self, id: &TaskId) -> String {
        match self {
            BlobKind::Input => format!("zip-{id}.zip"),
            BlobKind::Result => format!("result-{id}.json"),
        }
    }
}

/// Filesystem-backed blob storage rooted at one upload directory.
///
/// Cheap to clone; holds only paths.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base: PathBuf,
    inputs: PathBuf,
    results: PathBuf,
}

impl BlobStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            inputs: base.join(BlobKind::Input.dir_name()),
            results: base.join(BlobKind::Result.dir_name()),
            base,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Create both blob directories.
    pub async fn ensure(&self) -> Result<(), BlobError> {
        for dir in [&self.inputs, &self.results] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| BlobError::io(dir, e))?;
        }
        Ok(())
    }

    pub fn dir(&self, kind: BlobKind) -> &Path {
        match kind {
            BlobKind::Input => &self.inputs,
            BlobKind::Result => &self.results,
        }
    }

    pub fn path(&self, kind: BlobKind, id: &TaskId) -> PathBuf {
        self.dir(kind).join(kind.file_name(id))
    }

    pub fn temp_path(&self, kind: BlobKind, id: &TaskId) -> PathBuf {
        self.dir(kind)
            .join(format!("{}{TEMP_SUFFIX}", kind.file_name(id)))
    }

    /// Stream `reader` into the blob, publishing it atomically.
    ///
    /// Returns the number of bytes written.  On failure the temp file is
    /// removed and any existing final file is left untouched.
    pub async fn save_stream<R>(
        &self,
        kind: BlobKind,
        id: &TaskId,
        reader: &mut R,
    ) -> Result<u64, BlobError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let tmp = self.temp_path(kind, id);
        let written = match write_and_sync(&tmp, reader).await {
            Ok(n) => n,
            Err(e) => {
                discard(&tmp).await;
                return Err(e);
            }
        };
        self.publish(kind, id).await?;
        debug!(task_id = %id, ?kind, bytes = written, "blob saved");
        Ok(written)
    }

    pub async fn save_bytes(
        &self,
        kind: BlobKind,
        id: &TaskId,
        bytes: &[u8],
    ) -> Result<u64, BlobError> {
        let mut reader = bytes;
        self.save_stream(kind, id, &mut reader).await
    }

    /// Rename a fully written temp file onto the final name.
    pub async fn publish(&self, kind: BlobKind, id: &TaskId) -> Result<(), BlobError> {
        let tmp = self.temp_path(kind, id);
        let dst = self.path(kind, id);
        if let Err(e) = fs::rename(&tmp, &dst).await {
            discard(&tmp).await;
            return Err(BlobError::io(tmp, e));
        }
        Ok(())
    }

    pub async fn read(&self, kind: BlobKind, id: &TaskId) -> Result<Vec<u8>, BlobError> {
        let path = self.path(kind, id);
        fs::read(&path).await.map_err(|e| BlobError::io(path, e))
    }

    pub async fn exists(&self, kind: BlobKind, id: &TaskId) -> Result<bool, BlobError> {
        let path = self.path(kind, id);
        fs::try_exists(&path)
            .await
            .map_err(|e| BlobError::io(path, e))
    }

    /// Delete the blob; an absent blob is not an error.
    pub async fn remove(&self, kind: BlobKind, id: &TaskId) -> Result<(), BlobError> {
        remove_if_exists(&self.path(kind, id)).await
    }

    pub async fn remove_temp(&self, kind: BlobKind, id: &TaskId) -> Result<(), BlobError> {
        remove_if_exists(&self.temp_path(kind, id)).await
    }

    /// Best-effort removal of every artifact of a task.
    ///
    /// All four paths are attempted; the first real failure is returned.
    pub async fn purge(&self, id: &TaskId) -> Result<(), BlobError> {
        let mut first_err = None;
        for kind in BlobKind::ALL {
            for path in [self.path(kind, id), self.temp_path(kind, id)] {
                if let Err(e) = remove_if_exists(&path).await {
                    warn!(task_id = %id, error = %e, "failed to remove blob");
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Bump the temp file's modification time to now.
    ///
    /// Keeps [`sweep_temp`](Self::sweep_temp) away from a file that a slow
    /// writer is still filling.  Returns `false` when there is no temp file.
    pub async fn touch_temp(&self, kind: BlobKind, id: &TaskId) -> Result<bool, BlobError> {
        let path = self.temp_path(kind, id);
        let file = match fs::OpenOptions::new().write(true).open(&path).await {
            Ok(file) => file.into_std().await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(BlobError::io(path, e)),
        };
        let now = SystemTime::now();
        tokio::task::spawn_blocking(move || file.set_modified(now))
            .await
            .map_err(std::io::Error::other)
            .and_then(|res| res)
            .map_err(|e| BlobError::io(path, e))?;
        Ok(true)
    }

    /// Remove `*.tmp` files older than `max_age` from the kind's directory.
    ///
    /// Independent of the ledger; covers temp files left behind by crashed
    /// writers.  A missing directory counts as empty.
    pub async fn sweep_temp(&self, kind: BlobKind, max_age: Duration) -> Result<usize, BlobError> {
        let dir = self.dir(kind);
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(BlobError::io(dir, e)),
        };

        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BlobError::io(dir, e))?
        {
            if !entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX) {
                continue;
            }
            // Entries that vanish or cannot be inspected are skipped.
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if modified >= cutoff {
                continue;
            }
            match remove_if_exists(&entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(error = %e, "failed to remove orphaned temp file"),
            }
        }
        Ok(removed)
    }
}

async fn write_and_sync<R>(tmp: &Path, reader: &mut R) -> Result<u64, BlobError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = fs::File::create(tmp)
        .await
        .map_err(|e| BlobError::io(tmp, e))?;
    let written = tokio::io::copy(reader, &mut file)
        .await
        .map_err(|e| BlobError::io(tmp, e))?;
    file.flush().await.map_err(|e| BlobError::io(tmp, e))?;
    file.sync_all().await.map_err(|e| BlobError::io(tmp, e))?;
    Ok(written)
}

async fn remove_if_exists(path: &Path) -> Result<(), BlobError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BlobError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

async fn discard(tmp: &Path) {
    if let Err(e) = remove_if_exists(tmp).await {
        warn!(error = %e, "failed to remove temp file after aborted write");
    }
}
