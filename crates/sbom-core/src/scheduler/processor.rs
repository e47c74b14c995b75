//! The external processing step run for each claimed task.

use std::future::Future;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::ExecutionError;

/// Placeholder replaced by the input path in [`CommandProcessor`] arguments.
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// Upper bound on stderr kept for the diagnostic.
pub const STDERR_CAP: usize = 16 * 1024;

/// Upper bound on a persisted diagnostic, in bytes.
pub const MAX_DIAGNOSTIC_BYTES: usize = 2048;

/// Turns an input blob into a result file.
pub trait Processor: Send + Sync + 'static {
    /// Read `input` and write the complete result to `output`.
    ///
    /// `output` is a temp path owned by the caller, which publishes or
    /// removes it depending on the outcome.  Implementations must stop and
    /// return [`ExecutionError::Cancelled`] promptly once `cancel` fires.
    fn process(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), ExecutionError>> + Send;
}

/// Runs an external program per task, capturing its stdout as the result.
#[derive(Clone, Debug)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
}

impl Default for CommandProcessor {
    /// `syft {input} -o json`
    fn default() -> Self {
        Self::new("syft", ["{input}", "-o", "json"])
    }
}

impl CommandProcessor {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Build from a whitespace-separated argument template.
    pub fn from_template(program: impl Into<String>, template: &str) -> Self {
        Self::new(program, template.split_whitespace())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn args_for(&self, input: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace(INPUT_PLACEHOLDER, &input))
            .collect()
    }
}

impl Processor for CommandProcessor {
    async fn process(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        let args = self.args_for(input);
        trace!(program = %self.program, ?args, "spawn");

        let mut out = File::create(output).await?;
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecutionError::Spawn)?;

        let outcome = {
            let run = drive(&mut child, &mut out);
            tokio::pin!(run);
            tokio::select! {
                res = &mut run => Some(res),
                _ = cancel.cancelled() => None,
            }
        };

        let Some(result) = outcome else {
            debug!(program = %self.program, "cancelled; killing child");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill processor");
            }
            return Err(ExecutionError::Cancelled);
        };

        let (status, stderr) = result?;
        if !status.success() {
            return Err(ExecutionError::NonZeroExit {
                code: status.code(),
                stderr: stderr.trim().to_owned(),
            });
        }
        out.flush().await?;
        out.sync_all().await?;
        debug!(program = %self.program, "processor succeeded");
        Ok(())
    }
}

/// Pump stdout into `out` and collect stderr until the child exits.
async fn drive(child: &mut Child, out: &mut File) -> Result<(ExitStatus, String), ExecutionError> {
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("child stderr not captured"))?;

    let (_, stderr, status) = tokio::try_join!(
        tokio::io::copy(&mut stdout, out),
        read_capped(stderr, STDERR_CAP),
        child.wait(),
    )?;
    Ok((status, stderr))
}

/// Drain `reader` completely, keeping only the first `cap` bytes.
///
/// The pipe must be drained even past the cap or the child blocks on a
/// full stderr buffer.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> std::io::Result<String> {
    let mut kept = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        kept.extend_from_slice(&buf[..n.min(room)]);
    }
    Ok(String::from_utf8_lossy(&kept).into_owned())
}

/// Normalise a diagnostic for storage.
///
/// Control characters become spaces, runs of whitespace collapse to one
/// space, and the result is cut to [`MAX_DIAGNOSTIC_BYTES`] on a char
/// boundary with a trailing `…`.
pub fn sanitize_diagnostic(raw: &str) -> String {
    let cleaned = raw
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.len() <= MAX_DIAGNOSTIC_BYTES {
        return collapsed;
    }
    let ellipsis = '…';
    let mut end = MAX_DIAGNOSTIC_BYTES - ellipsis.len_utf8();
    while !collapsed.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = collapsed[..end].to_owned();
    out.push(ellipsis);
    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn sanitize_replaces_controls_and_collapses_whitespace() {
        let raw = "line one\n\tline\u{7}two   \r\n end ";
        assert_eq!(sanitize_diagnostic(raw), "line one line two end");
    }

    #[test]
    fn sanitize_truncates_on_char_boundary() {
        let raw = "é".repeat(3000);
        let out = sanitize_diagnostic(&raw);
        assert!(out.len() <= MAX_DIAGNOSTIC_BYTES);
        assert!(out.ends_with('…'));
        assert!(out.trim_end_matches('…').chars().all(|c| c == 'é'));
    }

    #[test]
    fn short_diagnostics_are_untouched() {
        assert_eq!(sanitize_diagnostic("exit code 1: boom"), "exit code 1: boom");
    }

    #[test]
    fn placeholder_is_substituted_in_every_argument() {
        let p = CommandProcessor::from_template("scan", "{input} --name={input} -o json");
        let args = p.args_for(Path::new("/data/zip-a.zip"));
        assert_eq!(
            args,
            ["/data/zip-a.zip", "--name=/data/zip-a.zip", "-o", "json"]
        );
    }

    #[test]
    fn default_runs_syft_with_json_output() {
        let p = CommandProcessor::default();
        assert_eq!(p.program(), "syft");
        assert_eq!(p.args_for(Path::new("in.zip")), ["in.zip", "-o", "json"]);
    }

    #[tokio::test]
    async fn stderr_is_capped_but_fully_drained() {
        let data = vec![b'x'; 3 * STDERR_CAP];
        let kept = read_capped(&data[..], STDERR_CAP).await.unwrap();
        assert_eq!(kept.len(), STDERR_CAP);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = CommandProcessor::new("definitely-not-a-real-scanner-binary", ["{input}"]);
        let err = p
            .process(
                &dir.path().join("in"),
                &dir.path().join("out"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Spawn(_)), "got {err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdout_becomes_the_result_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.json");
        let output = dir.path().join("out.json");
        tokio::fs::write(&input, br#"{"ok":true}"#).await.unwrap();

        let p = CommandProcessor::new("cat", ["{input}"]);
        p.process(&input, &output, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(&output).await.unwrap(), br#"{"ok":true}"#);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_carries_code_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let p = CommandProcessor::new("sh", ["-c", "echo 'bad archive' >&2; exit 3"]);
        let err = p
            .process(
                &dir.path().join("in"),
                &dir.path().join("out"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            ExecutionError::NonZeroExit { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "bad archive");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let p = CommandProcessor::new("sleep", ["30"]);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = p
            .process(&dir.path().join("in"), &dir.path().join("out"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
